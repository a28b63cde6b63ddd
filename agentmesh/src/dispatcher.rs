use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::{retry, RetryPolicy};
use crate::errors::{MeshError, Result};
use crate::queue::QueueFabric;
use crate::registry::{AgentRegistration, AgentRegistry};
use crate::routing::{RouteDecision, RouteOutcome, RoutingTable};
use crate::status::{StatusSink, StatusUpdate};
use crate::task::{reasons, Task, TaskStatus};
use crate::telemetry::{MeshObserver, NoopObserver};

pub const DISPATCHER_INBOX: &str = "dispatcher";
const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub inbox: String,
    /// Retries against the same rule when the target is missing or unhealthy.
    pub target_retry: RetryPolicy,
    /// Retries of a failed publish before falling back to HTTP delivery.
    pub publish_retry: RetryPolicy,
    pub consume_timeout: Duration,
    pub diagnostics_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            inbox: DISPATCHER_INBOX.to_string(),
            target_retry: RetryPolicy::new(3, Duration::from_millis(200)),
            publish_retry: RetryPolicy::new(3, Duration::from_millis(100)),
            consume_timeout: Duration::from_secs(1),
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }
}

impl DispatcherConfig {
    pub fn with_inbox(mut self, inbox: impl Into<String>) -> Self {
        self.inbox = inbox.into();
        self
    }

    pub fn with_target_retry(mut self, policy: RetryPolicy) -> Self {
        self.target_retry = policy;
        self
    }

    pub fn with_publish_retry(mut self, policy: RetryPolicy) -> Self {
        self.publish_retry = policy;
        self
    }

    pub fn with_consume_timeout(mut self, timeout: Duration) -> Self {
        self.consume_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    NoRoute,
    TargetUnavailable,
    TransportFallback,
    DeadLettered,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEvent {
    pub at: DateTime<Utc>,
    pub task_id: Uuid,
    pub kind: DiagnosticKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Queued {
        target: String,
        rule_id: String,
        queue: String,
    },
    Forwarded {
        target: String,
        rule_id: String,
        endpoint: String,
    },
    DeadLettered {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub task_id: Uuid,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

impl DispatchReport {
    pub fn target(&self) -> Option<&str> {
        match &self.outcome {
            DispatchOutcome::Queued { target, .. } | DispatchOutcome::Forwarded { target, .. } => {
                Some(target)
            }
            DispatchOutcome::DeadLettered { .. } => None,
        }
    }
}

/// Synchronous delivery to an agent's HTTP endpoint.
#[async_trait]
pub trait DirectTransport: Send + Sync {
    async fn deliver(&self, endpoint: &str, task: &Task) -> Result<()>;
}

pub struct HttpForwarder {
    http: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MeshError::InvalidOperation(err.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl DirectTransport for HttpForwarder {
    async fn deliver(&self, endpoint: &str, task: &Task) -> Result<()> {
        let response = self
            .http
            .post(endpoint)
            .json(task)
            .send()
            .await
            .map_err(|err| MeshError::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MeshError::Transport(format!(
                "{endpoint} answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Rule-based router. Owns the routing table and consults the registry; it
/// never looks at a payload beyond what the matching predicate reads.
pub struct Dispatcher {
    config: DispatcherConfig,
    table: RwLock<Arc<RoutingTable>>,
    registry: Arc<AgentRegistry>,
    fabric: Arc<QueueFabric>,
    status: Option<Arc<dyn StatusSink>>,
    direct: Option<Arc<dyn DirectTransport>>,
    observer: Arc<dyn MeshObserver>,
    diagnostics: Mutex<VecDeque<DiagnosticEvent>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        table: RoutingTable,
        registry: Arc<AgentRegistry>,
        fabric: Arc<QueueFabric>,
    ) -> Result<Self> {
        fabric.declare(&config.inbox)?;
        Ok(Self {
            config,
            table: RwLock::new(Arc::new(table)),
            registry,
            fabric,
            status: None,
            direct: None,
            observer: Arc::new(NoopObserver),
            diagnostics: Mutex::new(VecDeque::new()),
        })
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = Some(sink);
        self
    }

    pub fn with_direct_transport(mut self, transport: Arc<dyn DirectTransport>) -> Self {
        self.direct = Some(transport);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn inbox(&self) -> &str {
        &self.config.inbox
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Current table. Callers keep a consistent snapshot even across reloads.
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.read().clone()
    }

    /// Swaps in a new table as a whole.
    pub fn reload(&self, table: RoutingTable) -> usize {
        let rules = table.len();
        *self.table.write() = Arc::new(table);
        info!(rules, "routing table reloaded");
        rules
    }

    pub fn route(&self, task: &Task) -> RouteOutcome {
        self.table().route(task)
    }

    /// Registers the agent and declares its queue.
    pub fn register_agent(&self, registration: AgentRegistration) -> Result<()> {
        self.fabric.declare(&registration.queue)?;
        self.registry.register(registration)?;
        Ok(())
    }

    /// Queues `task` for the dispatcher loop instead of routing inline.
    pub fn submit(&self, task: Task) -> Result<Uuid> {
        let task = task.admitted();
        let id = task.id;
        self.fabric.publish(&self.config.inbox, task)?;
        Ok(id)
    }

    /// Routes one task and hands it to its target. Undeliverable tasks are
    /// dead-lettered, never dropped. Fails only for tasks that already
    /// reached a terminal status.
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind))]
    pub async fn dispatch(&self, task: Task) -> Result<DispatchReport> {
        if task.is_terminal() {
            return Err(MeshError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Dispatched,
            });
        }
        let started = Instant::now();
        let task_id = task.id;

        let decision = match self.route(&task) {
            RouteOutcome::Routed(decision) => decision,
            RouteOutcome::NoRoute => {
                self.record(
                    task_id,
                    DiagnosticKind::NoRoute,
                    format!("no rule matches kind '{}'", task.kind),
                );
                return Ok(self.bury(task, reasons::NO_MATCHING_RULE));
            }
        };
        debug!(target = %decision.target, rule_id = %decision.rule_id, "rule matched");

        let registration = match self.await_target(&decision).await {
            Ok(registration) => registration,
            Err(err) => {
                self.record(task_id, DiagnosticKind::TargetUnavailable, err.to_string());
                return Ok(self.bury(task, reasons::TARGET_UNAVAILABLE));
            }
        };

        let mut routed = task;
        routed.assigned_to = Some(decision.target.clone());
        if let Some(priority) = decision.priority {
            routed.priority = priority;
        }
        routed.advance(TaskStatus::Dispatched)?;
        self.report(
            StatusUpdate::for_task(&routed).with_agent(decision.target.clone()),
        );

        let queue = registration.queue.clone();
        let published = retry(&self.config.publish_retry, |_| {
            std::future::ready(self.fabric.publish(&queue, routed.clone()))
        })
        .await;

        let outcome = match published {
            Ok(_) => DispatchOutcome::Queued {
                target: decision.target.clone(),
                rule_id: decision.rule_id.clone(),
                queue,
            },
            Err(err) => match self.fallback(&registration, &decision, &routed, err).await {
                Some(outcome) => outcome,
                None => return Ok(self.bury(routed, reasons::TRANSPORT_FAILURE)),
            },
        };
        self.observer.task_routed(&decision.target, started.elapsed());
        info!(target = %decision.target, rule_id = %decision.rule_id, "task dispatched");
        Ok(DispatchReport { task_id, outcome })
    }

    /// Consumes the inbox until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(inbox = %self.config.inbox, "dispatcher loop started");
        let wait = self.config.consume_timeout;
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = self.fabric.consume(&self.config.inbox, wait) => delivery,
            };
            match delivery {
                Ok(Some(delivery)) => {
                    let task_id = delivery.task.id;
                    if let Err(err) = self.dispatch(delivery.task.clone()).await {
                        warn!(%task_id, "task cannot be dispatched: {err}");
                        self.bury(delivery.task, reasons::UNDISPATCHABLE);
                    }
                    if let Err(err) = self.fabric.acknowledge(&delivery.token) {
                        warn!(%task_id, "failed to acknowledge inbox delivery: {err}");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("dispatcher inbox unavailable: {err}");
                    sleep(self.config.consume_timeout).await;
                }
            }
        }
        info!("dispatcher loop stopped");
    }

    pub fn diagnostics(&self, limit: usize) -> Vec<DiagnosticEvent> {
        self.diagnostics
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    async fn await_target(&self, decision: &RouteDecision) -> Result<AgentRegistration> {
        let policy = &self.config.target_retry;
        let mut backoff = policy.backoff();
        let mut attempt = 0u32;
        loop {
            match self.registry.ensure_available(&decision.target).await {
                Ok(registration) => return Ok(registration),
                Err(err) if attempt < policy.max_retries => {
                    let delay = backoff.next_delay();
                    debug!(
                        target = %decision.target,
                        attempt,
                        ?delay,
                        "target not ready, retrying same rule: {err}"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fallback(
        &self,
        registration: &AgentRegistration,
        decision: &RouteDecision,
        task: &Task,
        cause: MeshError,
    ) -> Option<DispatchOutcome> {
        let (Some(endpoint), Some(direct)) = (&registration.http_endpoint, &self.direct) else {
            self.record(
                task.id,
                DiagnosticKind::TransportFallback,
                format!("queue publish failed and no HTTP endpoint is known: {cause}"),
            );
            return None;
        };
        match direct.deliver(endpoint, task).await {
            Ok(()) => {
                self.record(
                    task.id,
                    DiagnosticKind::TransportFallback,
                    format!("delivered over HTTP after queue failure: {cause}"),
                );
                Some(DispatchOutcome::Forwarded {
                    target: decision.target.clone(),
                    rule_id: decision.rule_id.clone(),
                    endpoint: endpoint.clone(),
                })
            }
            Err(err) => {
                self.record(
                    task.id,
                    DiagnosticKind::TransportFallback,
                    format!("queue failed ({cause}) and HTTP delivery failed ({err})"),
                );
                None
            }
        }
    }

    fn bury(&self, task: Task, reason: &str) -> DispatchReport {
        let task_id = task.id;
        if let Err(err) = self.fabric.dead_letter(task, reason) {
            warn!(%task_id, "failed to park dead letter: {err}");
        }
        self.record(task_id, DiagnosticKind::DeadLettered, reason.to_string());
        DispatchReport {
            task_id,
            outcome: DispatchOutcome::DeadLettered {
                reason: reason.to_string(),
            },
        }
    }

    fn report(&self, update: StatusUpdate) {
        if let Some(sink) = &self.status {
            if let Err(err) = sink.report_status(update) {
                debug!("status board rejected dispatch update: {err}");
            }
        }
    }

    fn record(&self, task_id: Uuid, kind: DiagnosticKind, detail: String) {
        let mut guard = self.diagnostics.lock();
        guard.push_back(DiagnosticEvent {
            at: Utc::now(),
            task_id,
            kind,
            detail,
        });
        while guard.len() > self.config.diagnostics_capacity {
            guard.pop_front();
        }
    }
}
