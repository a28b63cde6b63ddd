use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, instrument};
use uuid::Uuid;

use super::plan::{RepairAction, RepairOperation};
use crate::errors::{MeshError, Result};

const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandLine {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Fills `{component}`, `{detail}` and `{incident_id}` in the arguments.
    pub fn render(&self, action: &RepairAction) -> CommandLine {
        let incident_id = action.incident_id.to_string();
        let args = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{component}", &action.target)
                    .replace("{detail}", &action.diff_description)
                    .replace("{incident_id}", &incident_id)
            })
            .collect();
        CommandLine {
            program: self.program.clone(),
            args,
        }
    }
}

/// Operator configuration for one operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationCommand {
    #[serde(flatten)]
    pub apply: CommandLine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<CommandLine>,
}

/// State captured before an action is applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPoint {
    pub action_id: Uuid,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandLine>,
    pub note: String,
}

impl RollbackPoint {
    /// A point for actions that have nothing to revert, like a restart.
    pub fn none(action: &RepairAction) -> Self {
        Self {
            action_id: action.id,
            captured_at: Utc::now(),
            command: None,
            note: format!("{} leaves nothing to revert", action.operation),
        }
    }
}

#[async_trait]
pub trait RepairExecutor: Send + Sync {
    async fn capture(&self, action: &RepairAction) -> Result<RollbackPoint>;

    async fn apply(&self, action: &RepairAction) -> Result<String>;

    async fn rollback(&self, action: &RepairAction, point: &RollbackPoint) -> Result<()>;
}

/// Runs an operator-configured program per operation. Only allow-listed
/// programs are started, with a cleared environment and a timeout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    allowed_programs: HashSet<String>,
    commands: HashMap<RepairOperation, OperationCommand>,
    fixed_env: HashMap<String, String>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub fn new(
        allowed_programs: impl IntoIterator<Item = String>,
        commands: HashMap<RepairOperation, OperationCommand>,
        timeout: Duration,
    ) -> Result<Self> {
        let allowed_programs: HashSet<String> = allowed_programs
            .into_iter()
            .map(|program| program.trim().to_string())
            .filter(|program| !program.is_empty())
            .collect();
        if timeout.is_zero() {
            return Err(MeshError::InvalidOperation(
                "repair command timeout must be greater than zero".to_string(),
            ));
        }
        for (operation, command) in &commands {
            let programs = std::iter::once(&command.apply).chain(command.rollback.iter());
            for line in programs {
                if !allowed_programs.contains(&line.program) {
                    return Err(MeshError::InvalidOperation(format!(
                        "program '{}' for {operation} is not on the allowed program list",
                        line.program
                    )));
                }
            }
        }
        let fixed_env = std::env::var("PATH")
            .map(|path| HashMap::from([("PATH".to_string(), path)]))
            .unwrap_or_default();
        Ok(Self {
            allowed_programs,
            commands,
            fixed_env,
            timeout,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        })
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes.max(256);
        self
    }

    pub fn operations(&self) -> impl Iterator<Item = &RepairOperation> {
        self.commands.keys()
    }

    fn command(&self, operation: RepairOperation) -> Result<&OperationCommand> {
        self.commands.get(&operation).ok_or_else(|| {
            MeshError::InvalidOperation(format!("no command configured for {operation}"))
        })
    }

    async fn run(&self, line: &CommandLine) -> Result<String> {
        if !self.allowed_programs.contains(&line.program) {
            return Err(MeshError::InvalidOperation(format!(
                "program '{}' is not permitted",
                line.program
            )));
        }
        let mut command = Command::new(&line.program);
        command
            .args(&line.args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();
        for (key, value) in &self.fixed_env {
            command.env(key, value);
        }

        let child = command.spawn()?;
        let started = Instant::now();
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(MeshError::Timeout(self.timeout)),
        };
        let stdout = truncated(&output.stdout, self.max_output_bytes);
        if !output.status.success() {
            let stderr = truncated(&output.stderr, self.max_output_bytes);
            return Err(MeshError::AgentProcessing(format!(
                "'{}' exited with {}: {}",
                line.program,
                output.status,
                stderr.trim()
            )));
        }
        info!(
            program = %line.program,
            elapsed = ?started.elapsed(),
            "repair command finished"
        );
        Ok(stdout)
    }
}

fn truncated(bytes: &[u8], limit: usize) -> String {
    let end = bytes.len().min(limit);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[async_trait]
impl RepairExecutor for CommandExecutor {
    async fn capture(&self, action: &RepairAction) -> Result<RollbackPoint> {
        let command = self.command(action.operation)?;
        Ok(match &command.rollback {
            Some(rollback) => RollbackPoint {
                action_id: action.id,
                captured_at: Utc::now(),
                command: Some(rollback.render(action)),
                note: format!("revert with '{}'", rollback.program),
            },
            None => RollbackPoint::none(action),
        })
    }

    #[instrument(
        skip(self, action),
        fields(operation = %action.operation, target = %action.target)
    )]
    async fn apply(&self, action: &RepairAction) -> Result<String> {
        let command = self.command(action.operation)?;
        self.run(&command.apply.render(action)).await
    }

    async fn rollback(&self, _action: &RepairAction, point: &RollbackPoint) -> Result<()> {
        match &point.command {
            Some(line) => self.run(line).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Records actions instead of running anything.
#[derive(Default)]
pub struct MemoryExecutor {
    applied: Mutex<Vec<RepairAction>>,
    rolled_back: Mutex<Vec<Uuid>>,
    failing: Mutex<HashSet<RepairOperation>>,
    hook: Option<Box<dyn Fn(&RepairAction) + Send + Sync>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `hook` for every successfully applied action.
    pub fn with_hook(mut self, hook: impl Fn(&RepairAction) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn fail(&self, operation: RepairOperation) {
        self.failing.lock().insert(operation);
    }

    pub fn applied(&self) -> Vec<RepairAction> {
        self.applied.lock().clone()
    }

    pub fn rolled_back(&self) -> Vec<Uuid> {
        self.rolled_back.lock().clone()
    }
}

#[async_trait]
impl RepairExecutor for MemoryExecutor {
    async fn capture(&self, action: &RepairAction) -> Result<RollbackPoint> {
        Ok(RollbackPoint::none(action))
    }

    async fn apply(&self, action: &RepairAction) -> Result<String> {
        if self.failing.lock().contains(&action.operation) {
            return Err(MeshError::AgentProcessing(format!("{} failed", action.operation)));
        }
        self.applied.lock().push(action.clone());
        if let Some(hook) = &self.hook {
            hook(action);
        }
        Ok(format!("{} applied to {}", action.operation, action.target))
    }

    async fn rollback(&self, action: &RepairAction, _point: &RollbackPoint) -> Result<()> {
        self.rolled_back.lock().push(action.id);
        Ok(())
    }
}

/// At most `max` applied actions per rolling `window`.
#[derive(Debug)]
pub struct ActionRateLimiter {
    max: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl ActionRateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn has_capacity(&self) -> bool {
        let mut stamps = self.stamps.lock();
        self.expire(&mut stamps);
        stamps.len() < self.max
    }

    pub fn try_acquire(&self) -> bool {
        let mut stamps = self.stamps.lock();
        self.expire(&mut stamps);
        if stamps.len() >= self.max {
            return false;
        }
        stamps.push_back(Instant::now());
        true
    }

    fn expire(&self, stamps: &mut VecDeque<Instant>) {
        while let Some(oldest) = stamps.front() {
            if oldest.elapsed() < self.window {
                break;
            }
            stamps.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::{Incident, Severity, SignalType};

    fn action(operation: RepairOperation) -> RepairAction {
        let incident = Incident::new(
            "gateway-liveness",
            SignalType::ProcessDown,
            "gateway",
            Severity::High,
            "down",
        );
        RepairAction::new(&incident, operation, "restart process 'gateway'")
    }

    #[test]
    fn templates_are_filled() {
        let action = action(RepairOperation::RestartProcess);
        let line = CommandLine::new(
            "systemctl",
            vec!["restart".into(), "{component}.service".into()],
        );
        assert_eq!(line.render(&action).args, vec!["restart", "gateway.service"]);
    }

    #[test]
    fn unlisted_programs_are_rejected_at_construction() {
        let commands = HashMap::from([(
            RepairOperation::RestartProcess,
            OperationCommand {
                apply: CommandLine::new("bash", vec!["-c".into(), "kill -9 1".into()]),
                rollback: None,
            },
        )]);
        let allowed = vec!["systemctl".to_string()];
        let err = CommandExecutor::new(allowed, commands, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, MeshError::InvalidOperation(_)));
    }

    #[test]
    fn commands_parse_from_operator_json() {
        let raw = r#"{
            "restart_process": {"program": "systemctl", "args": ["restart", "{component}"]},
            "raise_resource_limit": {
                "program": "ulimit-bump",
                "args": ["{component}"],
                "rollback": {"program": "ulimit-reset", "args": ["{component}"]}
            }
        }"#;
        let commands: HashMap<RepairOperation, OperationCommand> =
            serde_json::from_str(raw).unwrap();
        assert_eq!(commands.len(), 2);
        assert!(commands[&RepairOperation::RaiseResourceLimit].rollback.is_some());
        assert!(serde_json::from_str::<HashMap<RepairOperation, OperationCommand>>(
            r#"{"delete_service": {"program": "rm"}}"#
        )
        .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_executor_runs_and_reports_failures() {
        let commands = HashMap::from([
            (
                RepairOperation::RestartProcess,
                OperationCommand {
                    apply: CommandLine::new("echo", vec!["restarted".into(), "{component}".into()]),
                    rollback: None,
                },
            ),
            (
                RepairOperation::RaiseResourceLimit,
                OperationCommand {
                    apply: CommandLine::new("false", Vec::new()),
                    rollback: Some(CommandLine::new("true", Vec::new())),
                },
            ),
        ]);
        let executor = CommandExecutor::new(
            ["echo", "false", "true"].map(String::from),
            commands,
            Duration::from_secs(5),
        )
        .unwrap();

        let restart = action(RepairOperation::RestartProcess);
        assert_eq!(executor.apply(&restart).await.unwrap().trim(), "restarted gateway");

        let raise = action(RepairOperation::RaiseResourceLimit);
        let point = executor.capture(&raise).await.unwrap();
        assert!(point.command.is_some());
        assert!(executor.apply(&raise).await.is_err());
        executor.rollback(&raise, &point).await.unwrap();

        let guard = action(RepairOperation::AddDefensiveGuard);
        assert!(executor.apply(&guard).await.is_err());
    }

    #[test]
    fn rate_limiter_caps_actions_per_window() {
        let limiter = ActionRateLimiter::new(3, Duration::from_secs(3600));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.has_capacity());
        assert!(limiter.try_acquire());
        assert!(!limiter.has_capacity());
        assert!(!limiter.try_acquire());

        let short = ActionRateLimiter::new(1, Duration::from_millis(0));
        assert!(short.try_acquire());
        assert!(short.try_acquire());
    }
}
