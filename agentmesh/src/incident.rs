use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{MeshError, Result};
use crate::task::{Task, TaskKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    ProcessDown,
    ErrorRate,
    Latency,
}

impl Display for SignalType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SignalType::ProcessDown => "process_down",
            SignalType::ErrorRate => "error_rate",
            SignalType::Latency => "latency",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }

    /// Queue priority for incident tasks of this severity.
    pub fn priority(self) -> i32 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 3,
            Severity::High => 6,
            Severity::Critical => 9,
        }
    }
}

/// At most one incident per signature is open at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IncidentSignature {
    pub signal_type: SignalType,
    pub affected_component: String,
}

impl IncidentSignature {
    pub fn new(signal_type: SignalType, affected_component: impl Into<String>) -> Self {
        Self {
            signal_type,
            affected_component: affected_component.into(),
        }
    }
}

impl Display for IncidentSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.signal_type, self.affected_component)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub id: Uuid,
    pub signal_type: SignalType,
    pub severity: Severity,
    pub evidence: String,
    pub affected_component: String,
    /// Name of the health signal that raised this incident; re-read during
    /// repair verification.
    pub signal: String,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub repair_attempts: u32,
}

impl Incident {
    pub fn new(
        signal: impl Into<String>,
        signal_type: SignalType,
        affected_component: impl Into<String>,
        severity: Severity,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_type,
            severity,
            evidence: evidence.into(),
            affected_component: affected_component.into(),
            signal: signal.into(),
            opened_at: Utc::now(),
            repair_attempts: 0,
        }
    }

    pub fn signature(&self) -> IncidentSignature {
        IncidentSignature::new(self.signal_type, self.affected_component.clone())
    }

    /// The same incident after one more failed repair.
    pub fn escalated(&self, evidence: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.repair_attempts = self.repair_attempts.saturating_add(1);
        next.severity = self.severity.escalate();
        next.evidence = evidence.into();
        next
    }

    pub fn to_task(&self, origin: &str) -> Result<Task> {
        Ok(Task::new(TaskKind::Incident, serde_json::to_value(self)?, origin)
            .with_priority(self.severity.priority()))
    }

    pub fn from_task(task: &Task) -> Result<Self> {
        if task.kind != TaskKind::Incident {
            return Err(MeshError::InvalidOperation(format!(
                "expected an incident task, got '{}'",
                task.kind
            )));
        }
        Ok(serde_json::from_value(task.payload.clone())?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Closed,
    Escalated,
}

/// Sent by Repair (or an operator) to tell Monitoring how an incident ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentUpdate {
    pub incident_id: Uuid,
    pub signature: IncidentSignature,
    pub resolution: Resolution,
    pub summary: String,
}

impl IncidentUpdate {
    pub fn to_task(&self, origin: &str) -> Result<Task> {
        Ok(Task::new(
            TaskKind::IncidentUpdate,
            serde_json::to_value(self)?,
            origin,
        ))
    }

    pub fn from_task(task: &Task) -> Result<Self> {
        if task.kind != TaskKind::IncidentUpdate {
            return Err(MeshError::InvalidOperation(format!(
                "expected an incident update, got '{}'",
                task.kind
            )));
        }
        Ok(serde_json::from_value(task.payload.clone())?)
    }
}
