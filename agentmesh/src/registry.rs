use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{MeshError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    /// Synchronous delivery endpoint, used when the queue is unreachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_endpoint: Option<String>,
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl AgentRegistration {
    pub fn new(agent_id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            queue: queue.into(),
            health_endpoint: None,
            http_endpoint: None,
            kinds: Vec::new(),
            version: default_version(),
            description: String::new(),
        }
    }

    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_health_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.health_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_http_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.http_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Online,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    #[serde(flatten)]
    pub registration: AgentRegistration,
    pub health: AgentHealth,
    pub error_count: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RegistryReport {
    pub total: usize,
    pub online: usize,
    pub degraded: usize,
    pub offline: usize,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_errors: u32,
    pub heartbeat_staleness: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_errors: 5,
            heartbeat_staleness: None,
        }
    }
}

impl RegistryConfig {
    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors.max(1);
        self
    }

    pub fn with_heartbeat_staleness(mut self, staleness: Duration) -> Self {
        self.heartbeat_staleness = Some(staleness);
        self
    }
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, registration: &AgentRegistration) -> bool;
}

/// Probes `health_endpoint` with a GET; agents without one are assumed up.
pub struct HttpHealthChecker {
    http: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MeshError::InvalidOperation(err.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, registration: &AgentRegistration) -> bool {
        let Some(endpoint) = &registration.health_endpoint else {
            return true;
        };
        match self.http.get(endpoint).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(agent = %registration.agent_id, "health check failed: {err}");
                false
            }
        }
    }
}

/// Live directory of agents, keyed by agent id.
pub struct AgentRegistry {
    config: RegistryConfig,
    agents: RwLock<HashMap<String, AgentRecord>>,
    checker: Option<Arc<dyn HealthChecker>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
            checker: None,
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Re-registering replaces the previous entry and resets its health.
    pub fn register(&self, registration: AgentRegistration) -> Result<AgentRecord> {
        if registration.agent_id.trim().is_empty() || registration.queue.trim().is_empty() {
            return Err(MeshError::InvalidOperation(
                "agent id and queue must not be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let record = AgentRecord {
            registration,
            health: AgentHealth::Online,
            error_count: 0,
            registered_at: now,
            last_heartbeat: now,
        };
        info!(
            agent = %record.registration.agent_id,
            queue = %record.registration.queue,
            kinds = ?record.registration.kinds,
            "agent registered"
        );
        self.agents
            .write()
            .insert(record.registration.agent_id.clone(), record.clone());
        Ok(record)
    }

    pub fn deregister(&self, agent_id: &str) -> Option<AgentRecord> {
        let removed = self.agents.write().remove(agent_id);
        if removed.is_some() {
            info!(agent = agent_id, "agent deregistered");
        }
        removed
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self.agents.read().values().cloned().collect();
        records.sort_by(|a, b| a.registration.agent_id.cmp(&b.registration.agent_id));
        records
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<AgentHealth> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| MeshError::UnregisteredTarget(agent_id.to_string()))?;
        record.last_heartbeat = Utc::now();
        record.error_count = 0;
        record.health = AgentHealth::Online;
        Ok(record.health)
    }

    /// Liveness only: refreshes the heartbeat without clearing errors.
    pub fn touch(&self, agent_id: &str) -> Result<AgentHealth> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| MeshError::UnregisteredTarget(agent_id.to_string()))?;
        record.last_heartbeat = Utc::now();
        Ok(record.health)
    }

    pub fn report_error(&self, agent_id: &str) -> Result<AgentHealth> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| MeshError::UnregisteredTarget(agent_id.to_string()))?;
        record.error_count = record.error_count.saturating_add(1);
        let previous = record.health;
        record.health = if record.error_count >= self.config.max_errors {
            AgentHealth::Offline
        } else if record.error_count >= self.config.max_errors / 2 {
            AgentHealth::Degraded
        } else {
            record.health
        };
        if record.health != previous {
            warn!(
                agent = agent_id,
                errors = record.error_count,
                health = ?record.health,
                "agent health changed"
            );
        }
        Ok(record.health)
    }

    pub fn report(&self) -> RegistryReport {
        let agents = self.agents.read();
        let mut report = RegistryReport {
            total: agents.len(),
            ..RegistryReport::default()
        };
        for record in agents.values() {
            match record.health {
                AgentHealth::Online => report.online += 1,
                AgentHealth::Degraded => report.degraded += 1,
                AgentHealth::Offline => report.offline += 1,
            }
        }
        report
    }

    /// Returns the registration if `agent_id` may receive work right now.
    pub async fn ensure_available(&self, agent_id: &str) -> Result<AgentRegistration> {
        let record = self
            .get(agent_id)
            .ok_or_else(|| MeshError::UnregisteredTarget(agent_id.to_string()))?;
        if record.health == AgentHealth::Offline {
            return Err(MeshError::TargetUnavailable(agent_id.to_string()));
        }
        if let Some(staleness) = self.config.heartbeat_staleness {
            let silent = (Utc::now() - record.last_heartbeat)
                .to_std()
                .unwrap_or_default();
            if silent > staleness {
                return Err(MeshError::TargetUnavailable(agent_id.to_string()));
            }
        }
        if let Some(checker) = &self.checker {
            if !checker.check(&record.registration).await {
                self.report_error(agent_id)?;
                return Err(MeshError::TargetUnavailable(agent_id.to_string()));
            }
        }
        Ok(record.registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagChecker(AtomicBool);

    #[async_trait]
    impl HealthChecker for FlagChecker {
        async fn check(&self, _registration: &AgentRegistration) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn errors_degrade_then_take_offline() {
        let registry = AgentRegistry::default();
        registry
            .register(AgentRegistration::new("repair", "repair"))
            .unwrap();
        assert_eq!(registry.report_error("repair").unwrap(), AgentHealth::Online);
        assert_eq!(registry.report_error("repair").unwrap(), AgentHealth::Degraded);
        for _ in 0..3 {
            registry.report_error("repair").unwrap();
        }
        assert_eq!(registry.get("repair").unwrap().health, AgentHealth::Offline);
        assert_eq!(registry.report().offline, 1);

        assert_eq!(registry.touch("repair").unwrap(), AgentHealth::Offline);
        assert_eq!(registry.get("repair").unwrap().error_count, 5);
        assert_eq!(registry.heartbeat("repair").unwrap(), AgentHealth::Online);
        assert_eq!(registry.get("repair").unwrap().error_count, 0);
    }

    #[tokio::test]
    async fn availability_checks() {
        let checker = Arc::new(FlagChecker(AtomicBool::new(true)));
        let registry = AgentRegistry::default().with_checker(checker.clone());
        assert!(matches!(
            registry.ensure_available("ghost").await,
            Err(MeshError::UnregisteredTarget(_))
        ));

        registry
            .register(
                AgentRegistration::new("orchestrator", "orchestrator")
                    .with_kinds(["chat"])
                    .with_health_endpoint("http://localhost:9/health"),
            )
            .unwrap();
        let registration = registry.ensure_available("orchestrator").await.unwrap();
        assert_eq!(registration.kinds, vec!["chat".to_string()]);

        checker.0.store(false, Ordering::SeqCst);
        assert!(matches!(
            registry.ensure_available("orchestrator").await,
            Err(MeshError::TargetUnavailable(_))
        ));
        assert_eq!(registry.get("orchestrator").unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn stale_heartbeat_is_unavailable() {
        let registry = AgentRegistry::new(
            RegistryConfig::default().with_heartbeat_staleness(Duration::from_millis(5)),
        );
        registry
            .register(AgentRegistration::new("monitoring", "monitoring"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            registry.ensure_available("monitoring").await,
            Err(MeshError::TargetUnavailable(_))
        ));
        registry.heartbeat("monitoring").unwrap();
        assert!(registry.ensure_available("monitoring").await.is_ok());
    }

    #[test]
    fn registration_defaults_from_json() {
        let registration: AgentRegistration =
            serde_json::from_str(r#"{"agent_id": "pricing", "queue": "pricing"}"#).unwrap();
        assert_eq!(registration.version, "1.0");
        assert!(registration.kinds.is_empty());
    }
}
