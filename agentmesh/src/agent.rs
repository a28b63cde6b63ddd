use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{MeshError, Result};
use crate::queue::QueueFabric;
use crate::registry::{AgentRegistration, AgentRegistry};
use crate::status::{StatusSink, StatusUpdate};
use crate::task::{Task, TaskStatus};

/// A message an agent wants sent once its current task is acknowledged.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Hand to the dispatcher inbox for rule-based routing.
    Route(Task),
    /// Publish straight to a named queue, e.g. a requester's `reply_to`.
    Direct { queue: String, task: Task },
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub result: Option<Value>,
    pub outbound: Vec<Outbound>,
}

impl HandlerOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn route(mut self, task: Task) -> Self {
        self.outbound.push(Outbound::Route(task));
        self
    }

    pub fn send(mut self, queue: impl Into<String>, task: Task) -> Self {
        self.outbound.push(Outbound::Direct {
            queue: queue.into(),
            task,
        });
        self
    }
}

/// What every agent implements. Handlers must converge to the same end state
/// when a task is delivered more than once.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    fn registration(&self) -> AgentRegistration;

    async fn handle(&self, task: Task, cancellation: CancellationToken) -> Result<HandlerOutcome>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub consume_timeout: Duration,
    pub inbox: String,
    pub error_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consume_timeout: Duration::from_secs(1),
            inbox: crate::dispatcher::DISPATCHER_INBOX.to_string(),
            error_pause: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn with_consume_timeout(mut self, timeout: Duration) -> Self {
        self.consume_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_inbox(mut self, inbox: impl Into<String>) -> Self {
        self.inbox = inbox.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Handed back for redelivery after a transient failure.
    Requeued,
    Failed,
    /// Already finished by an earlier delivery; acknowledged without work.
    Skipped,
}

impl Disposition {
    pub fn is_success(self) -> bool {
        matches!(self, Disposition::Completed | Disposition::Skipped)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub task_id: Uuid,
    pub disposition: Disposition,
}

/// Drives one [`AgentHandler`]: consume, handle, acknowledge-or-nack, report.
pub struct AgentWorker {
    handler: Arc<dyn AgentHandler>,
    fabric: Arc<QueueFabric>,
    registry: Arc<AgentRegistry>,
    status: Arc<dyn StatusSink>,
    config: WorkerConfig,
    registration: AgentRegistration,
}

impl AgentWorker {
    pub fn new(
        handler: Arc<dyn AgentHandler>,
        fabric: Arc<QueueFabric>,
        registry: Arc<AgentRegistry>,
        status: Arc<dyn StatusSink>,
        config: WorkerConfig,
    ) -> Self {
        let registration = handler.registration();
        Self {
            handler,
            fabric,
            registry,
            status,
            config,
            registration,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.registration.agent_id
    }

    /// Announces identity, queue and health endpoint.
    pub fn register(&self) -> Result<AgentRegistration> {
        self.fabric.declare(&self.registration.queue)?;
        self.registry.register(self.registration.clone())?;
        Ok(self.registration.clone())
    }

    pub fn report_status(&self, task_id: Uuid, status: TaskStatus) -> Result<()> {
        self.status
            .report_status(StatusUpdate::new(task_id, status).with_agent(self.agent_id()))
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.register()?;
        info!(agent = %self.agent_id(), queue = %self.registration.queue, "agent worker started");
        while !shutdown.is_cancelled() {
            match self.process_one(&shutdown).await {
                Ok(report) => {
                    // Only a handled task clears the error count; idle polls
                    // and failures just show the worker is alive.
                    let handled = report.map_or(false, |report| report.disposition.is_success());
                    let beat = if handled {
                        self.registry.heartbeat(self.agent_id())
                    } else {
                        self.registry.touch(self.agent_id())
                    };
                    if let Err(err) = beat {
                        // Deregistered underneath us; announce again.
                        debug!(agent = %self.agent_id(), "heartbeat rejected: {err}");
                        self.register()?;
                    }
                }
                Err(err) => {
                    warn!(agent = %self.agent_id(), "consume failed: {err}");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = sleep(self.config.error_pause) => {}
                    }
                }
            }
        }
        info!(agent = %self.agent_id(), "agent worker stopped");
        Ok(())
    }

    /// Handles at most one delivery. `Ok(None)` means the queue stayed empty
    /// for the whole consume timeout.
    pub async fn process_one(&self, shutdown: &CancellationToken) -> Result<Option<ProcessReport>> {
        let queue = &self.registration.queue;
        let consumed = tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            consumed = self.fabric.consume(queue, self.config.consume_timeout) => consumed?,
        };
        let Some(delivery) = consumed else {
            return Ok(None);
        };
        let mut task = delivery.task;
        let task_id = task.id;
        let agent = self.agent_id().to_string();

        let already_done = self
            .status
            .current(&task_id)
            .map(TaskStatus::is_terminal)
            .unwrap_or(false);
        if already_done || task.advance(TaskStatus::InProgress).is_err() {
            debug!(%task_id, agent = %agent, "task already finished, acknowledging duplicate");
            self.fabric.acknowledge(&delivery.token)?;
            return Ok(Some(ProcessReport {
                task_id,
                disposition: Disposition::Skipped,
            }));
        }
        self.report(StatusUpdate::for_task(&task).with_agent(agent.clone()));

        let cancellation = shutdown.child_token();
        let outcome = self.handler.handle(task.clone(), cancellation).await;
        let disposition = match outcome {
            Ok(outcome) => {
                if let Err(err) = self.flush(outcome.outbound) {
                    warn!(%task_id, agent = %agent, "follow-up publish failed, requeueing: {err}");
                    self.fabric.nack(&delivery.token, true)?;
                    return Ok(Some(ProcessReport {
                        task_id,
                        disposition: Disposition::Requeued,
                    }));
                }
                self.fabric.acknowledge(&delivery.token)?;
                let mut update =
                    StatusUpdate::new(task_id, TaskStatus::Completed).with_agent(agent.clone());
                if let Some(result) = outcome.result {
                    update = update.with_result(result);
                }
                self.report(update);
                Disposition::Completed
            }
            Err(err) if err.is_transient() || matches!(err, MeshError::Cancelled) => {
                warn!(
                    %task_id,
                    agent = %agent,
                    attempts = task.attempts,
                    "handler failed, requeueing: {err}"
                );
                if let Err(err) = self.registry.report_error(&agent) {
                    warn!(agent = %agent, "could not record handler failure: {err}");
                }
                self.fabric.nack(&delivery.token, true)?;
                Disposition::Requeued
            }
            Err(err) => {
                warn!(%task_id, agent = %agent, "handler failed permanently: {err}");
                self.fabric.acknowledge(&delivery.token)?;
                self.report(
                    StatusUpdate::new(task_id, TaskStatus::Failed)
                        .with_agent(agent.clone())
                        .with_reason(err.to_string()),
                );
                Disposition::Failed
            }
        };
        Ok(Some(ProcessReport {
            task_id,
            disposition,
        }))
    }

    fn flush(&self, outbound: Vec<Outbound>) -> Result<()> {
        for message in outbound {
            match message {
                Outbound::Route(task) => {
                    self.status_track(&task);
                    self.fabric.publish(&self.config.inbox, task)?;
                }
                Outbound::Direct { queue, task } => {
                    self.status_track(&task);
                    self.fabric.publish(&queue, task)?;
                }
            }
        }
        Ok(())
    }

    fn status_track(&self, task: &Task) {
        if self.status.current(&task.id).is_none() {
            self.report(StatusUpdate::for_task(task));
        }
    }

    fn report(&self, update: StatusUpdate) {
        if let Err(err) = self.status.report_status(update) {
            debug!(agent = %self.agent_id(), "status update ignored: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{FabricConfig, DEAD_LETTER_QUEUE};
    use crate::registry::AgentHealth;
    use crate::status::StatusBoard;
    use crate::task::TaskKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoAgent {
        calls: AtomicU32,
        fail_with: Option<fn() -> MeshError>,
    }

    #[async_trait]
    impl AgentHandler for EchoAgent {
        fn registration(&self) -> AgentRegistration {
            AgentRegistration::new("echo", "echo").with_kinds(["chat"])
        }

        async fn handle(
            &self,
            task: Task,
            cancellation: CancellationToken,
        ) -> Result<HandlerOutcome> {
            if cancellation.is_cancelled() {
                return Err(MeshError::Cancelled);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            let reply = task.reply(TaskKind::ChatReply, json!({ "reply_text": "pong" }), "echo");
            let mut outcome = HandlerOutcome::done().with_result(json!({ "echoed": true }));
            if let Some(queue) = &task.reply_to {
                outcome = outcome.send(queue.clone(), reply);
            }
            Ok(outcome)
        }
    }

    fn worker(
        fail_with: Option<fn() -> MeshError>,
        max_attempts: u32,
    ) -> (AgentWorker, Arc<QueueFabric>, Arc<StatusBoard>, Arc<EchoAgent>) {
        let fabric = Arc::new(QueueFabric::new(
            FabricConfig::default()
                .with_max_attempts(max_attempts)
                .with_redelivery_delay(Duration::from_millis(1), Duration::from_millis(1))
                .with_poll_interval(Duration::from_millis(5)),
        ));
        let board = Arc::new(StatusBoard::default());
        let handler = Arc::new(EchoAgent {
            calls: AtomicU32::new(0),
            fail_with,
        });
        let worker = AgentWorker::new(
            handler.clone(),
            fabric.clone(),
            Arc::new(AgentRegistry::default()),
            board.clone(),
            WorkerConfig::default().with_consume_timeout(Duration::from_millis(20)),
        );
        worker.register().unwrap();
        (worker, fabric, board, handler)
    }

    #[tokio::test]
    async fn completes_and_replies() {
        let (worker, fabric, board, _) = worker(None, 3);
        fabric.declare("frontend").unwrap();
        let task = Task::new(TaskKind::Chat, json!({ "text": "ping" }), "frontend")
            .with_reply_to("frontend");
        fabric.publish("echo", task.clone()).unwrap();

        let report = worker
            .process_one(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.disposition, Disposition::Completed);
        let record = board.get(&task.id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!({ "echoed": true })));

        let reply = fabric.try_consume("frontend").unwrap().unwrap();
        assert_eq!(reply.task.correlation_id, Some(task.id));
        assert_eq!(fabric.depth("echo").unwrap(), Default::default());
    }

    #[tokio::test]
    async fn transient_failures_requeue_until_dead_lettered() {
        let (worker, fabric, board, handler) =
            worker(Some(|| MeshError::AgentProcessing("flaky".into())), 2);
        let task = Task::new(TaskKind::Chat, json!({}), "frontend");
        board.track(&task).unwrap();
        fabric.publish("echo", task.clone()).unwrap();

        let shutdown = CancellationToken::new();
        let first = worker.process_one(&shutdown).await.unwrap().unwrap();
        assert_eq!(first.disposition, Disposition::Requeued);
        let second = worker.process_one(&shutdown).await.unwrap().unwrap();
        assert_eq!(second.disposition, Disposition::Requeued);
        assert!(worker.process_one(&shutdown).await.unwrap().is_none());

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let buried = fabric.peek(DEAD_LETTER_QUEUE, 1).unwrap();
        assert_eq!(buried[0].attempts, 2);
        assert_eq!(board.get(&task.id).unwrap().status, TaskStatus::DeadLettered);
    }

    #[tokio::test]
    async fn permanent_failure_marks_failed() {
        let (worker, fabric, board, _) =
            worker(Some(|| MeshError::InvalidOperation("bad payload".into())), 3);
        let task = Task::new(TaskKind::Chat, json!({}), "frontend");
        fabric.publish("echo", task.clone()).unwrap();
        let report = worker
            .process_one(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.disposition, Disposition::Failed);
        let record = board.get(&task.id).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.reason.unwrap().contains("bad payload"));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_skipped() {
        let (worker, fabric, board, handler) = worker(None, 3);
        let task = Task::new(TaskKind::Chat, json!({}), "frontend");
        board.track(&task).unwrap();
        board
            .apply(StatusUpdate::new(task.id, TaskStatus::Completed))
            .unwrap();
        fabric.publish("echo", task).unwrap();
        let report = worker
            .process_one(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.disposition, Disposition::Skipped);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (worker, _, _, _) = worker(None, 3);
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            stopper.cancel();
        });
        worker.run(shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn run_lets_repeated_failures_take_the_worker_offline() {
        let fabric = Arc::new(QueueFabric::new(
            FabricConfig::default()
                .with_max_attempts(50)
                .with_redelivery_delay(Duration::from_millis(1), Duration::from_millis(1))
                .with_poll_interval(Duration::from_millis(5)),
        ));
        let registry = Arc::new(AgentRegistry::default());
        let handler = Arc::new(EchoAgent {
            calls: AtomicU32::new(0),
            fail_with: Some(|| MeshError::AgentProcessing("rate limited".into())),
        });
        let worker = Arc::new(AgentWorker::new(
            handler.clone(),
            fabric.clone(),
            registry.clone(),
            Arc::new(StatusBoard::default()),
            WorkerConfig::default().with_consume_timeout(Duration::from_millis(20)),
        ));
        worker.register().unwrap();
        fabric
            .publish("echo", Task::new(TaskKind::Chat, json!({}), "frontend"))
            .unwrap();

        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while registry.get("echo").unwrap().health != AgentHealth::Offline {
            assert!(tokio::time::Instant::now() < deadline, "worker never went offline");
            sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert!(handler.calls.load(Ordering::SeqCst) >= 5);
        assert_eq!(registry.get("echo").unwrap().health, AgentHealth::Offline);
    }
}
