use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{MeshError, Result};

/// Task category. Drives routing; unknown kinds are carried verbatim so the
/// dispatcher can dead-letter them with a precise reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    Chat,
    ChatReply,
    Incident,
    IncidentUpdate,
    RepairRequest,
    HealthProbe,
    Other(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Chat => "chat",
            TaskKind::ChatReply => "chat_reply",
            TaskKind::Incident => "incident",
            TaskKind::IncidentUpdate => "incident_update",
            TaskKind::RepairRequest => "repair_request",
            TaskKind::HealthProbe => "health_probe",
            TaskKind::Other(value) => value.as_str(),
        }
    }
}

impl From<String> for TaskKind {
    fn from(value: String) -> Self {
        match value.trim() {
            "chat" => TaskKind::Chat,
            "chat_reply" => TaskKind::ChatReply,
            "incident" => TaskKind::Incident,
            "incident_update" => TaskKind::IncidentUpdate,
            "repair_request" => TaskKind::RepairRequest,
            "health_probe" => TaskKind::HealthProbe,
            other => TaskKind::Other(other.to_string()),
        }
    }
}

impl From<&str> for TaskKind {
    fn from(value: &str) -> Self {
        TaskKind::from(value.to_string())
    }
}

impl From<TaskKind> for String {
    fn from(value: TaskKind) -> Self {
        value.as_str().to_string()
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Dispatched,
    InProgress,
    Completed,
    Failed,
    DeadLettered,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLettered
        )
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Dispatched => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLettered => 3,
        }
    }

    /// Monotonic along pending -> dispatched -> in_progress -> terminal.
    /// Re-reporting the current status is accepted so redelivered work stays
    /// idempotent.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
        };
        f.write_str(label)
    }
}

/// Reasons attached to dead-lettered tasks.
pub mod reasons {
    pub const NO_MATCHING_RULE: &str = "no_matching_rule";
    pub const TARGET_UNAVAILABLE: &str = "target_unavailable";
    pub const MAX_ATTEMPTS_EXCEEDED: &str = "max_attempts_exceeded";
    pub const REJECTED: &str = "rejected";
    pub const TRANSPORT_FAILURE: &str = "transport_failure";
    pub const UNDISPATCHABLE: &str = "undispatchable";
}

/// The envelope every component exchanges. Always passed by value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub kind: TaskKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl Task {
    pub fn new(kind: impl Into<TaskKind>, payload: Value, origin: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            origin: origin.into(),
            priority: 0,
            created_at: Utc::now(),
            attempts: 0,
            status: TaskStatus::Pending,
            status_reason: None,
            assigned_to: None,
            reply_to: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Lifecycle fields are owned by the mesh; whatever a client sent for
    /// them is discarded when the task enters.
    pub fn admitted(mut self) -> Self {
        self.status = TaskStatus::Pending;
        self.status_reason = None;
        self.attempts = 0;
        self.assigned_to = None;
        self
    }

    pub fn advance(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MeshError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Moves the task to `dead_lettered`. A task that already finished keeps
    /// its terminal state.
    pub fn dead_letter(&mut self, reason: impl Into<String>) -> Result<()> {
        self.advance(TaskStatus::DeadLettered)?;
        self.status_reason = Some(reason.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Builds a reply addressed back to this task's requester.
    pub fn reply(&self, kind: impl Into<TaskKind>, payload: Value, origin: &str) -> Task {
        Task::new(kind, payload, origin)
            .with_priority(self.priority)
            .with_correlation(self.id)
    }
}
