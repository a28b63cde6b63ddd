use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorFailure {
    RateLimited,
    Timeout,
    InvalidResponse,
}

impl std::fmt::Display for CollaboratorFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CollaboratorFailure::RateLimited => "rate_limited",
            CollaboratorFailure::Timeout => "timeout",
            CollaboratorFailure::InvalidResponse => "invalid_response",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("no route for task '{task_id}': {reason}")]
    NoRoute { task_id: String, reason: String },
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),
    #[error("agent '{0}' is not registered")]
    UnregisteredTarget(String),
    #[error("agent '{0}' failed its health check")]
    TargetUnavailable(String),
    #[error("routing table is ambiguous: {0}")]
    AmbiguousRules(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("agent processing failed: {0}")]
    AgentProcessing(String),
    #[error("repair verification failed for incident '{incident_id}': {detail}")]
    RepairVerificationFailure { incident_id: String, detail: String },
    #[error("repair operation '{0}' is not on the allow-list")]
    ActionNotAllowed(String),
    #[error("external collaborator failed ({kind}): {detail}")]
    Collaborator {
        kind: CollaboratorFailure,
        detail: String,
    },
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("ack token '{0}' is unknown or expired")]
    UnknownAckToken(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("network request failed: {0}")]
    Network(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MeshError {
    /// Faults worth redelivering: the same task may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::Transport(_)
                | MeshError::AgentProcessing(_)
                | MeshError::Network(_)
                | MeshError::Timeout(_)
                | MeshError::TargetUnavailable(_)
                | MeshError::Io(_)
                | MeshError::Collaborator {
                    kind: CollaboratorFailure::RateLimited | CollaboratorFailure::Timeout,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
