use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agentmesh::monitoring::SignalConfig;
use agentmesh::repair::{OperationCommand, RepairOperation};
use agentmesh::routing::{MatchPredicate, RoutingRule, RoutingTable};
use anyhow::Context;
use serde::de::DeserializeOwned;

/// Everything the daemon reads from its environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub journal_path: Option<PathBuf>,
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub redelivery_delay: Duration,
    pub max_redelivery_delay: Duration,
    pub dead_letter_capacity: usize,
    pub routing_rules: Option<PathBuf>,
    pub monitor_interval: Duration,
    pub probe_timeout: Duration,
    pub signals: Vec<SignalConfig>,
    pub repair_max_attempts: u32,
    /// Defaults to `repair-ledger.jsonl` next to the queue journal.
    pub repair_ledger_path: Option<PathBuf>,
    pub repair_ledger_retention: Duration,
    pub repair_commands: HashMap<RepairOperation, OperationCommand>,
    pub repair_allowed_programs: Vec<String>,
    pub repair_command_timeout: Duration,
    pub approval_timeout: Duration,
    pub operator_webhook_url: Option<String>,
    pub operator_recipient: String,
    pub llm_endpoint: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_timeout: Duration,
    pub system_prompt: Option<String>,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str, default: u64| {
            text(key)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default)
        };
        let millis = |key: &str, default: u64| Duration::from_millis(number(key, default));

        let bind_addr = text("MESH_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:7080".to_string())
            .parse()
            .context("MESH_BIND_ADDR is not a socket address")?;

        let repair_allowed_programs = text("REPAIR_ALLOWED_PROGRAMS")
            .map(|value| {
                value
                    .split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let journal_path = text("MESH_JOURNAL_PATH").map(PathBuf::from);
        let repair_ledger_path = text("REPAIR_LEDGER_PATH").map(PathBuf::from).or_else(|| {
            journal_path
                .as_ref()
                .map(|path| path.with_file_name("repair-ledger.jsonl"))
        });

        Ok(Self {
            bind_addr,
            journal_path,
            // Outlasts the default approval wait so parked repairs are not redelivered.
            visibility_timeout: millis("MESH_VISIBILITY_TIMEOUT_MS", 31 * 60 * 1000),
            max_attempts: number("MESH_MAX_ATTEMPTS", 5) as u32,
            redelivery_delay: millis("MESH_REDELIVERY_DELAY_MS", 2_000),
            max_redelivery_delay: millis("MESH_MAX_REDELIVERY_DELAY_MS", 300_000),
            dead_letter_capacity: number("MESH_DEAD_LETTER_CAPACITY", 1_000) as usize,
            routing_rules: text("MESH_ROUTING_RULES").map(PathBuf::from),
            monitor_interval: millis("MONITOR_INTERVAL_MS", 300_000),
            probe_timeout: millis("MONITOR_PROBE_TIMEOUT_MS", 10_000),
            signals: json_list(text("MONITOR_SIGNALS"), "MONITOR_SIGNALS")?,
            repair_max_attempts: number("REPAIR_MAX_ATTEMPTS", 3) as u32,
            repair_ledger_path,
            repair_ledger_retention: Duration::from_secs(
                number("REPAIR_LEDGER_RETENTION_HOURS", 168) * 3600,
            ),
            repair_commands: json_list(text("REPAIR_COMMANDS"), "REPAIR_COMMANDS")?,
            repair_allowed_programs,
            repair_command_timeout: millis("REPAIR_COMMAND_TIMEOUT_MS", 60_000),
            approval_timeout: millis("REPAIR_APPROVAL_TIMEOUT_MS", 30 * 60 * 1000),
            operator_webhook_url: text("OPERATOR_WEBHOOK_URL"),
            operator_recipient: text("OPERATOR_RECIPIENT")
                .unwrap_or_else(|| "operator".to_string()),
            llm_endpoint: text("LLM_ENDPOINT")
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            llm_model: text("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            llm_api_key: text("LLM_API_KEY"),
            llm_timeout: millis("LLM_TIMEOUT_MS", 30_000),
            system_prompt: text("LLM_SYSTEM_PROMPT"),
            database_url: text("DATABASE_URL"),
            database_max_connections: number("MESH_DATABASE_MAX_CONNECTIONS", 10) as u32,
        })
    }

    pub fn routing_table(&self) -> anyhow::Result<RoutingTable> {
        match &self.routing_rules {
            Some(path) => RoutingTable::load(path)
                .with_context(|| format!("failed to load routing rules from {}", path.display())),
            None => Ok(default_routing_table()?),
        }
    }
}

/// Unset means empty; malformed JSON is a startup error.
fn json_list<T: DeserializeOwned + Default>(raw: Option<String>, key: &str) -> anyhow::Result<T> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).with_context(|| format!("{key} is not valid JSON")),
        None => Ok(T::default()),
    }
}

/// Wiring used when no rule file is configured.
pub fn default_routing_table() -> agentmesh::Result<RoutingTable> {
    RoutingTable::new(vec![
        RoutingRule::new("incidents", MatchPredicate::kind("incident"), "repair"),
        RoutingRule::new(
            "incident-updates",
            MatchPredicate::kind("incident_update"),
            "monitoring",
        ),
        RoutingRule::new("chat", MatchPredicate::kind("chat"), "orchestrator"),
    ])
}
