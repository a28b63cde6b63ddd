use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{MeshError, Result};
use crate::incident::{Incident, SignalType};

const DETAIL_CHARS: usize = 200;

const CONFIG_HINTS: &[&str] = &[
    "missing config",
    "missing key",
    "configuration",
    "config key",
    "environment variable",
    "not set",
    "unset",
];

const RESOURCE_HINTS: &[&str] = &[
    "out of memory",
    "oom",
    "no space left",
    "disk full",
    "too many open files",
    "resource exhausted",
    "memory limit",
];

const DEPENDENCY_COMPONENTS: &[&str] = &[
    "postgres", "database", "db", "redis", "rabbitmq", "broker", "cache", "queue",
];

const DEPENDENCY_HINTS: &[&str] = &["upstream", "dependency", "database unavailable"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    ConfigDrift,
    ResourceExhaustion,
    CodeDefect,
    DependencyFailure,
}

/// The only operations Repair can ever propose. Nothing here removes or
/// deletes; parsing anything else fails with `ActionNotAllowed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum RepairOperation {
    RestartProcess,
    RestartDependency,
    AddDefensiveGuard,
    AddMissingConfigKey,
    RaiseResourceLimit,
}

impl RepairOperation {
    pub const ALLOWED: [RepairOperation; 5] = [
        RepairOperation::RestartProcess,
        RepairOperation::RestartDependency,
        RepairOperation::AddDefensiveGuard,
        RepairOperation::AddMissingConfigKey,
        RepairOperation::RaiseResourceLimit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RepairOperation::RestartProcess => "restart_process",
            RepairOperation::RestartDependency => "restart_dependency",
            RepairOperation::AddDefensiveGuard => "add_defensive_guard",
            RepairOperation::AddMissingConfigKey => "add_missing_config_key",
            RepairOperation::RaiseResourceLimit => "raise_resource_limit",
        }
    }

    pub fn risk_class(self) -> RiskClass {
        match self {
            RepairOperation::RestartProcess | RepairOperation::RestartDependency => {
                RiskClass::Defensive
            }
            RepairOperation::AddMissingConfigKey | RepairOperation::RaiseResourceLimit => {
                RiskClass::Additive
            }
            RepairOperation::AddDefensiveGuard => RiskClass::Unknown,
        }
    }
}

impl FromStr for RepairOperation {
    type Err = MeshError;

    fn from_str(value: &str) -> Result<Self> {
        RepairOperation::ALLOWED
            .into_iter()
            .find(|operation| operation.as_str() == value)
            .ok_or_else(|| MeshError::ActionNotAllowed(value.to_string()))
    }
}

impl TryFrom<String> for RepairOperation {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RepairOperation> for String {
    fn from(operation: RepairOperation) -> Self {
        operation.as_str().to_string()
    }
}

impl Display for RepairOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `Unknown` actions wait for operator approval before they are applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Additive,
    Defensive,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub passed: bool,
    pub evidence: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnosis {
    pub root_cause: RootCause,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairAction {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub operation: RepairOperation,
    pub target: String,
    pub diff_description: String,
    pub risk_class: RiskClass,
    pub attempt: u32,
    /// Same incident, operation, target and attempt yield the same
    /// fingerprint, so a redelivered incident maps to the same action.
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<VerificationResult>,
}

impl RepairAction {
    pub fn new(
        incident: &Incident,
        operation: RepairOperation,
        diff_description: impl Into<String>,
    ) -> Self {
        let digest = Sha256::new()
            .chain_update(incident.id.as_bytes())
            .chain_update(operation.as_str().as_bytes())
            .chain_update(incident.affected_component.as_bytes())
            .chain_update(incident.repair_attempts.to_be_bytes())
            .finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self {
            id: Uuid::from_bytes(id),
            incident_id: incident.id,
            operation,
            target: incident.affected_component.clone(),
            diff_description: diff_description.into(),
            risk_class: operation.risk_class(),
            attempt: incident.repair_attempts,
            fingerprint: hex::encode(digest),
            applied_at: None,
            verification_result: None,
        }
    }

    pub fn requires_approval(&self) -> bool {
        self.risk_class == RiskClass::Unknown
    }
}

/// Rule-based root cause from evidence keywords, component and signal type.
pub fn classify(incident: &Incident) -> Diagnosis {
    let evidence = incident.evidence.to_lowercase();
    let component = incident.affected_component.to_lowercase();

    if let Some(hint) = find_hint(&evidence, CONFIG_HINTS) {
        return Diagnosis {
            root_cause: RootCause::ConfigDrift,
            rationale: format!("evidence mentions '{hint}'"),
        };
    }
    if let Some(hint) = find_hint(&evidence, RESOURCE_HINTS) {
        return Diagnosis {
            root_cause: RootCause::ResourceExhaustion,
            rationale: format!("evidence mentions '{hint}'"),
        };
    }
    if DEPENDENCY_COMPONENTS.contains(&component.as_str()) {
        return Diagnosis {
            root_cause: RootCause::DependencyFailure,
            rationale: format!("'{component}' is a shared dependency"),
        };
    }
    if let Some(hint) = find_hint(&evidence, DEPENDENCY_HINTS) {
        return Diagnosis {
            root_cause: RootCause::DependencyFailure,
            rationale: format!("evidence mentions '{hint}'"),
        };
    }
    match incident.signal_type {
        SignalType::ProcessDown | SignalType::ErrorRate => Diagnosis {
            root_cause: RootCause::CodeDefect,
            rationale: format!("{} on '{component}' with no external cause", incident.signal_type),
        },
        SignalType::Latency => Diagnosis {
            root_cause: RootCause::ResourceExhaustion,
            rationale: format!("latency on '{component}' points at saturation"),
        },
    }
}

/// Picks the allow-listed operation for a diagnosis. A process that stays
/// down after a restart gets a defensive guard instead of another restart.
pub fn propose(incident: &Incident, diagnosis: &Diagnosis) -> RepairAction {
    let target = &incident.affected_component;
    let detail = evidence_detail(&incident.evidence);
    let (operation, description) = match (diagnosis.root_cause, incident.signal_type) {
        (RootCause::ConfigDrift, _) => (
            RepairOperation::AddMissingConfigKey,
            format!("add the missing configuration key for '{target}' ({detail})"),
        ),
        (RootCause::ResourceExhaustion, SignalType::ProcessDown) => (
            RepairOperation::RestartProcess,
            format!("restart '{target}' to release exhausted resources"),
        ),
        (RootCause::ResourceExhaustion, _) => (
            RepairOperation::RaiseResourceLimit,
            format!("raise the resource limit of '{target}'"),
        ),
        (RootCause::DependencyFailure, _) => (
            RepairOperation::RestartDependency,
            format!("restart dependency '{target}'"),
        ),
        (RootCause::CodeDefect, SignalType::ProcessDown) if incident.repair_attempts == 0 => (
            RepairOperation::RestartProcess,
            format!("restart process '{target}'"),
        ),
        (RootCause::CodeDefect, _) => (
            RepairOperation::AddDefensiveGuard,
            format!("add a defensive guard in '{target}' around: {detail}"),
        ),
    };
    RepairAction::new(incident, operation, description)
}

fn find_hint<'a>(evidence: &str, hints: &[&'a str]) -> Option<&'a str> {
    hints.iter().copied().find(|hint| evidence.contains(hint))
}

fn evidence_detail(evidence: &str) -> String {
    let line = evidence.lines().find(|line| !line.trim().is_empty()).unwrap_or("");
    line.trim().chars().take(DETAIL_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::Severity;

    fn incident(signal_type: SignalType, component: &str, evidence: &str) -> Incident {
        Incident::new("liveness", signal_type, component, Severity::Medium, evidence)
    }

    #[test]
    fn removal_operations_do_not_parse() {
        for name in ["delete_file", "remove_feature", "drop_table", "rm"] {
            let err = name.parse::<RepairOperation>().unwrap_err();
            assert!(matches!(err, MeshError::ActionNotAllowed(_)));
        }
        assert!(serde_json::from_str::<RepairOperation>("\"delete_module\"").is_err());
        assert_eq!(
            serde_json::from_str::<RepairOperation>("\"restart_process\"").unwrap(),
            RepairOperation::RestartProcess
        );
    }

    #[test]
    fn gateway_down_restarts_then_guards() {
        let down = incident(
            SignalType::ProcessDown,
            "gateway",
            "GET http://gateway/health failed: connection refused",
        );
        let first = propose(&down, &classify(&down));
        assert_eq!(first.operation, RepairOperation::RestartProcess);
        assert!(!first.requires_approval());

        let again = down.escalated("still refused");
        let second = propose(&again, &classify(&again));
        assert_eq!(second.operation, RepairOperation::AddDefensiveGuard);
        assert!(second.requires_approval());
        assert_ne!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn classification_by_evidence_and_component() {
        let config = incident(SignalType::ErrorRate, "api", "KeyError: missing config 'SMTP_HOST'");
        assert_eq!(classify(&config).root_cause, RootCause::ConfigDrift);
        assert_eq!(
            propose(&config, &classify(&config)).operation,
            RepairOperation::AddMissingConfigKey
        );

        let oom = incident(SignalType::Latency, "worker", "Out of memory: killed process 812");
        assert_eq!(propose(&oom, &classify(&oom)).operation, RepairOperation::RaiseResourceLimit);

        let db = incident(SignalType::ProcessDown, "postgres", "refused");
        assert_eq!(classify(&db).root_cause, RootCause::DependencyFailure);
        assert_eq!(propose(&db, &classify(&db)).operation, RepairOperation::RestartDependency);
    }

    #[test]
    fn fingerprint_is_stable_for_redelivery() {
        let down = incident(SignalType::ProcessDown, "gateway", "down");
        let a = propose(&down, &classify(&down));
        let b = propose(&down, &classify(&down));
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.id, b.id);
        assert_eq!(a.fingerprint.len(), 64);
    }
}
