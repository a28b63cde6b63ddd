use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::plan::{RepairAction, RepairOperation};
use crate::errors::{MeshError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub action_id: Uuid,
    pub incident_id: Uuid,
    pub operation: RepairOperation,
    pub target: String,
    pub diff_description: String,
    pub requested_at: DateTime<Utc>,
}

struct Waiting {
    request: ApprovalRequest,
    reply: oneshot::Sender<bool>,
}

/// Parks risky actions until an operator decides or the timeout passes.
pub struct ApprovalGate {
    timeout: Duration,
    waiting: Mutex<HashMap<Uuid, Waiting>>,
}

impl ApprovalGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for a decision on `action`. Cancellation while waiting returns
    /// `Cancelled` and withdraws the request.
    pub async fn request(
        &self,
        action: &RepairAction,
        cancellation: &CancellationToken,
    ) -> Result<ApprovalDecision> {
        let (reply, decision) = oneshot::channel();
        let request = ApprovalRequest {
            action_id: action.id,
            incident_id: action.incident_id,
            operation: action.operation,
            target: action.target.clone(),
            diff_description: action.diff_description.clone(),
            requested_at: Utc::now(),
        };
        // A redelivered incident asks again for the same action; the newest
        // waiter replaces the old one.
        self.waiting.lock().insert(action.id, Waiting { request, reply });
        info!(action_id = %action.id, operation = %action.operation, "awaiting operator approval");

        let outcome = tokio::select! {
            _ = cancellation.cancelled() => Err(MeshError::Cancelled),
            decided = tokio::time::timeout(self.timeout, decision) => match decided {
                Ok(Ok(true)) => Ok(ApprovalDecision::Approved),
                Ok(Ok(false)) => Ok(ApprovalDecision::Rejected),
                Ok(Err(_)) => Err(MeshError::Cancelled),
                Err(_) => Ok(ApprovalDecision::TimedOut),
            },
        };
        self.withdraw(action.id);
        if matches!(outcome, Ok(ApprovalDecision::TimedOut)) {
            warn!(action_id = %action.id, timeout = ?self.timeout, "approval timed out");
        }
        outcome
    }

    /// Delivers an operator decision.
    pub fn decide(&self, action_id: Uuid, approved: bool) -> Result<()> {
        let waiting = self.waiting.lock().remove(&action_id).ok_or_else(|| {
            MeshError::InvalidOperation(format!("no repair action '{action_id}' awaits approval"))
        })?;
        info!(%action_id, approved, "operator decided on repair action");
        waiting
            .reply
            .send(approved)
            .map_err(|_| {
                MeshError::InvalidOperation(format!(
                    "repair action '{action_id}' is no longer waiting"
                ))
            })
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .waiting
            .lock()
            .values()
            .map(|waiting| waiting.request.clone())
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        pending
    }

    /// Drops the entry unless a newer waiter still holds it.
    fn withdraw(&self, action_id: Uuid) {
        let mut waiting = self.waiting.lock();
        if waiting
            .get(&action_id)
            .map(|entry| entry.reply.is_closed())
            .unwrap_or(false)
        {
            waiting.remove(&action_id);
        }
    }
}
