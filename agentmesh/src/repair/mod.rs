//! Self-healing: classify an incident, propose an allow-listed action,
//! apply it with a rollback point, verify, and close or escalate.
//!
//! Every run walks a bounded state machine:
//! `Idle -> Analyzing -> Proposing -> [AwaitingApproval] -> Applying ->
//! Verifying -> Completed | RolledBack | Escalated`.

pub mod approval;
pub mod executor;
pub mod ledger;
pub mod plan;

use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{AgentHandler, HandlerOutcome};
use crate::errors::{MeshError, Result};
use crate::escalation::{notify_or_log, NoticeKind, OperatorChannel, OperatorNotice};
use crate::incident::{Incident, IncidentSignature, IncidentUpdate, Resolution};
use crate::registry::AgentRegistration;
use crate::task::{Task, TaskKind};
use crate::telemetry::{MeshObserver, NoopObserver};

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalRequest};
pub use executor::{
    ActionRateLimiter, CommandExecutor, CommandLine, MemoryExecutor, OperationCommand,
    RepairExecutor, RollbackPoint,
};
pub use ledger::{ActionLedger, LedgerEntry};
pub use plan::{
    classify, propose, Diagnosis, RepairAction, RepairOperation, RiskClass, RootCause,
    VerificationResult,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    Idle,
    Analyzing,
    Proposing,
    AwaitingApproval,
    Applying,
    Verifying,
    Completed,
    RolledBack,
    Escalated,
}

impl RepairState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RepairState::Completed | RepairState::RolledBack | RepairState::Escalated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RepairState::Idle => "idle",
            RepairState::Analyzing => "analyzing",
            RepairState::Proposing => "proposing",
            RepairState::AwaitingApproval => "awaiting_approval",
            RepairState::Applying => "applying",
            RepairState::Verifying => "verifying",
            RepairState::Completed => "completed",
            RepairState::RolledBack => "rolled_back",
            RepairState::Escalated => "escalated",
        }
    }
}

impl Display for RepairState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Re-runs the health check that raised an incident.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, incident: &Incident) -> Result<VerificationResult>;
}

#[derive(Debug, Clone)]
pub struct RepairConfig {
    pub agent_id: String,
    pub queue: String,
    /// Automatic attempts per incident before escalating to an operator.
    pub max_attempts: u32,
    /// Pause between applying an action and re-probing.
    pub verify_delay: Duration,
    pub approval_timeout: Duration,
    pub actions_per_window: usize,
    pub rate_window: Duration,
    pub history_capacity: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            agent_id: "repair".to_string(),
            queue: "repair".to_string(),
            max_attempts: 3,
            verify_delay: Duration::from_secs(5),
            approval_timeout: Duration::from_secs(30 * 60),
            actions_per_window: 3,
            rate_window: Duration::from_secs(3600),
            history_capacity: 100,
        }
    }
}

impl RepairConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.clamp(1, 10);
        self
    }

    pub fn with_verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_rate_limit(mut self, actions: usize, window: Duration) -> Self {
        self.actions_per_window = actions.max(1);
        self.rate_window = window;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }
}

/// One finished pass over an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRun {
    pub incident_id: Uuid,
    pub signature: IncidentSignature,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RepairAction>,
    pub trail: Vec<RepairState>,
    pub detail: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RepairRun {
    fn start(incident: &Incident) -> Self {
        Self {
            incident_id: incident.id,
            signature: incident.signature(),
            attempt: incident.repair_attempts,
            diagnosis: None,
            action: None,
            trail: vec![RepairState::Idle],
            detail: String::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn state(&self) -> RepairState {
        self.trail.last().copied().unwrap_or(RepairState::Idle)
    }

    fn enter(&mut self, state: RepairState) {
        info!(incident_id = %self.incident_id, %state, "repair state");
        self.trail.push(state);
    }
}

/// The repair agent. Handles `incident` tasks routed to its queue.
pub struct RepairAgent {
    config: RepairConfig,
    executor: Arc<dyn RepairExecutor>,
    verifier: Arc<dyn Verifier>,
    channel: Arc<dyn OperatorChannel>,
    ledger: Arc<ActionLedger>,
    approvals: Arc<ApprovalGate>,
    limiter: ActionRateLimiter,
    escalated: Mutex<HashMap<IncidentSignature, Uuid>>,
    history: Mutex<VecDeque<RepairRun>>,
    observer: Arc<dyn MeshObserver>,
}

impl RepairAgent {
    pub fn new(
        config: RepairConfig,
        executor: Arc<dyn RepairExecutor>,
        verifier: Arc<dyn Verifier>,
        channel: Arc<dyn OperatorChannel>,
    ) -> Self {
        let limiter = ActionRateLimiter::new(config.actions_per_window, config.rate_window);
        let approvals = Arc::new(ApprovalGate::new(config.approval_timeout));
        Self {
            config,
            executor,
            verifier,
            channel,
            ledger: Arc::new(ActionLedger::new()),
            approvals,
            limiter,
            escalated: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replaces the in-memory ledger, typically with one opened on a file.
    pub fn with_ledger(mut self, ledger: Arc<ActionLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ActionLedger> {
        &self.ledger
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    /// Most recent runs first.
    pub fn history(&self, limit: usize) -> Vec<RepairRun> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn is_escalated(&self, incident: &Incident) -> bool {
        self.escalated
            .lock()
            .get(&incident.signature())
            .map(|id| *id == incident.id)
            .unwrap_or(false)
    }

    /// Runs one incident through the state machine. Cancellation is honoured
    /// until `Applying` starts; after that the run always finishes.
    #[instrument(
        skip(self, incident, cancellation),
        fields(
            incident_id = %incident.id,
            signature = %incident.signature(),
            attempt = incident.repair_attempts
        )
    )]
    pub async fn repair(
        &self,
        incident: Incident,
        cancellation: &CancellationToken,
    ) -> Result<(RepairRun, HandlerOutcome)> {
        let mut run = RepairRun::start(&incident);

        if self.is_escalated(&incident) {
            run.detail = "already escalated; automatic repair stopped".to_string();
            info!("{}", run.detail);
            return Ok((run, HandlerOutcome::done()));
        }
        if incident.repair_attempts >= self.config.max_attempts {
            let reason = format!(
                "{} automatic repair attempts exhausted",
                incident.repair_attempts
            );
            return Ok(self.escalate(run, &incident, reason).await);
        }

        run.enter(RepairState::Analyzing);
        checkpoint(cancellation)?;
        let diagnosis = classify(&incident);
        run.diagnosis = Some(diagnosis.clone());

        run.enter(RepairState::Proposing);
        let mut action = propose(&incident, &diagnosis);
        info!(
            operation = %action.operation,
            risk = ?action.risk_class,
            root_cause = ?diagnosis.root_cause,
            "repair proposed: {}",
            action.diff_description
        );

        let rollback = match self.ledger.lookup(&action) {
            Some(entry) if entry.rolled_back => {
                // A redelivery of a run that already failed; replay its outcome.
                run.action = Some(action);
                run.enter(RepairState::RolledBack);
                run.detail = "action was already applied and rolled back".to_string();
                return Ok(self.after_rollback(run, &incident).await);
            }
            Some(entry) => {
                info!(fingerprint = %action.fingerprint, "action already applied, verifying only");
                action.applied_at = Some(entry.applied_at);
                entry.rollback
            }
            None => {
                if !self.limiter.has_capacity() {
                    return Err(MeshError::AgentProcessing(format!(
                        "repair rate limit of {} actions per {:?} reached",
                        self.config.actions_per_window, self.config.rate_window
                    )));
                }
                if action.requires_approval() {
                    run.enter(RepairState::AwaitingApproval);
                    notify_or_log(
                        self.channel.as_ref(),
                        OperatorNotice::new(
                            NoticeKind::ApprovalRequest,
                            format!("approve {} on {}?", action.operation, action.target),
                            format!(
                                "action {}: {}. Decide within {:?}.",
                                action.id, action.diff_description, self.config.approval_timeout
                            ),
                        )
                        .for_incident(incident.id),
                    )
                    .await;
                    match self.approvals.request(&action, cancellation).await? {
                        ApprovalDecision::Approved => {}
                        ApprovalDecision::Rejected => {
                            run.action = Some(action);
                            let reason = "operator rejected the proposed action".to_string();
                            return Ok(self.escalate(run, &incident, reason).await);
                        }
                        ApprovalDecision::TimedOut => {
                            run.action = Some(action);
                            let reason =
                                "no operator decision before the approval timeout".to_string();
                            return Ok(self.escalate(run, &incident, reason).await);
                        }
                    }
                }
                checkpoint(cancellation)?;
                if !self.limiter.try_acquire() {
                    return Err(MeshError::AgentProcessing(
                        "repair rate limit reached".to_string(),
                    ));
                }

                run.enter(RepairState::Applying);
                let point = match self.executor.capture(&action).await {
                    Ok(point) => point,
                    Err(err) => {
                        run.action = Some(action);
                        run.detail = format!("could not capture a rollback point: {err}");
                        run.enter(RepairState::RolledBack);
                        return Ok(self.after_rollback(run, &incident).await);
                    }
                };
                match self.executor.apply(&action).await {
                    Ok(output) => {
                        action.applied_at = Some(Utc::now());
                        if let Err(err) = self.ledger.record(&action, point.clone()) {
                            error!(
                                fingerprint = %action.fingerprint,
                                "applied action could not be persisted to the ledger: {err}"
                            );
                        }
                        info!(
                            fingerprint = %action.fingerprint,
                            "repair applied: {}",
                            output.trim()
                        );
                    }
                    Err(err) => {
                        warn!("repair action failed: {err}");
                        self.revert(&action, &point).await;
                        run.action = Some(action);
                        run.detail = format!("apply failed: {err}");
                        run.enter(RepairState::RolledBack);
                        return Ok(self.after_rollback(run, &incident).await);
                    }
                }
                point
            }
        };

        run.enter(RepairState::Verifying);
        if !self.config.verify_delay.is_zero() {
            tokio::time::sleep(self.config.verify_delay).await;
        }
        let verification = match self.verifier.verify(&incident).await {
            Ok(result) => result,
            Err(err) => VerificationResult {
                passed: false,
                evidence: format!("verification could not run: {err}"),
                checked_at: Utc::now(),
            },
        };
        action.verification_result = Some(verification.clone());
        run.action = Some(action.clone());

        if verification.passed {
            run.enter(RepairState::Completed);
            run.detail = format!("{} fixed {}", action.operation, incident.signature());
            let update = IncidentUpdate {
                incident_id: incident.id,
                signature: incident.signature(),
                resolution: Resolution::Closed,
                summary: run.detail.clone(),
            };
            notify_or_log(
                self.channel.as_ref(),
                OperatorNotice::new(
                    NoticeKind::RepairSummary,
                    format!("repaired {}", incident.signature()),
                    format!("{}: {}", action.diff_description, verification.evidence),
                )
                .for_incident(incident.id),
            )
            .await;
            let outcome = HandlerOutcome::done()
                .with_result(run_result(&run))
                .route(update.to_task(&self.config.agent_id)?);
            return Ok((self.finish(run), outcome));
        }

        let failure = MeshError::RepairVerificationFailure {
            incident_id: incident.id.to_string(),
            detail: verification.evidence.clone(),
        };
        error!("{failure}");
        self.revert(&action, &rollback).await;
        if let Err(err) = self.ledger.mark_rolled_back(&action) {
            error!(
                fingerprint = %action.fingerprint,
                "rollback could not be persisted to the ledger: {err}"
            );
        }
        run.detail = failure.to_string();
        run.enter(RepairState::RolledBack);
        Ok(self.after_rollback(run, &incident).await)
    }

    /// Requeues the incident with one more attempt, or escalates when the
    /// attempt budget is spent.
    async fn after_rollback(
        &self,
        run: RepairRun,
        incident: &Incident,
    ) -> (RepairRun, HandlerOutcome) {
        let next = incident.escalated(run.detail.clone());
        if next.repair_attempts >= self.config.max_attempts {
            let reason = format!(
                "repair failed {} times: {}",
                next.repair_attempts, run.detail
            );
            return self.escalate(run, incident, reason).await;
        }
        notify_or_log(
            self.channel.as_ref(),
            OperatorNotice::new(
                NoticeKind::RepairSummary,
                format!("repair of {} rolled back", incident.signature()),
                format!(
                    "attempt {} of {}: {}",
                    next.repair_attempts, self.config.max_attempts, run.detail
                ),
            )
            .for_incident(incident.id),
        )
        .await;
        let mut outcome = HandlerOutcome::done().with_result(run_result(&run));
        match next.to_task(&self.config.agent_id) {
            Ok(task) => outcome = outcome.route(task),
            Err(err) => error!("could not requeue incident: {err}"),
        }
        (self.finish(run), outcome)
    }

    async fn escalate(
        &self,
        mut run: RepairRun,
        incident: &Incident,
        reason: String,
    ) -> (RepairRun, HandlerOutcome) {
        run.enter(RepairState::Escalated);
        run.detail = reason;
        self.escalated.lock().insert(incident.signature(), incident.id);
        warn!(reason = %run.detail, "repair escalated to operator");
        notify_or_log(
            self.channel.as_ref(),
            OperatorNotice::new(
                NoticeKind::Escalation,
                format!("{} needs an operator", incident.signature()),
                format!(
                    "severity {:?}, evidence: {}. {}",
                    incident.severity, incident.evidence, run.detail
                ),
            )
            .for_incident(incident.id),
        )
        .await;
        let update = IncidentUpdate {
            incident_id: incident.id,
            signature: incident.signature(),
            resolution: Resolution::Escalated,
            summary: run.detail.clone(),
        };
        let mut outcome = HandlerOutcome::done().with_result(run_result(&run));
        match update.to_task(&self.config.agent_id) {
            Ok(task) => outcome = outcome.route(task),
            Err(err) => error!("could not report escalation: {err}"),
        }
        (self.finish(run), outcome)
    }

    async fn revert(&self, action: &RepairAction, point: &RollbackPoint) {
        if let Err(err) = self.executor.rollback(action, point).await {
            error!(action_id = %action.id, "rollback failed: {err}");
        }
    }

    fn finish(&self, mut run: RepairRun) -> RepairRun {
        run.finished_at = Some(Utc::now());
        self.observer.repair_finished(run.state());
        let mut history = self.history.lock();
        history.push_back(run.clone());
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
        run
    }
}

fn checkpoint(cancellation: &CancellationToken) -> Result<()> {
    if cancellation.is_cancelled() {
        return Err(MeshError::Cancelled);
    }
    Ok(())
}

fn run_result(run: &RepairRun) -> serde_json::Value {
    json!({
        "state": run.state(),
        "trail": run.trail,
        "action": run.action,
        "detail": run.detail,
    })
}

#[async_trait]
impl AgentHandler for RepairAgent {
    fn registration(&self) -> AgentRegistration {
        AgentRegistration::new(self.config.agent_id.clone(), self.config.queue.clone())
            .with_kinds([TaskKind::Incident.as_str()])
            .with_description("Applies allow-listed repairs to open incidents")
    }

    async fn handle(&self, task: Task, cancellation: CancellationToken) -> Result<HandlerOutcome> {
        let incident = Incident::from_task(&task)?;
        let (_, outcome) = self.repair(incident, &cancellation).await?;
        Ok(outcome)
    }
}
