//! Coordination core for a fleet of cooperating agents.
//!
//! Tasks travel through a durable [`queue::QueueFabric`], are routed by the
//! rule-based [`dispatcher::Dispatcher`], and are processed by agents that
//! implement [`agent::AgentHandler`]. The [`monitoring::Monitor`] and the
//! [`repair::RepairAgent`] close the self-healing loop.

pub mod agent;
pub mod backoff;
pub mod dispatcher;
pub mod errors;
pub mod escalation;
pub mod incident;
pub mod journal;
pub mod monitoring;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod repair;
pub mod routing;
pub mod status;
pub mod task;
pub mod telemetry;

pub use agent::{AgentHandler, AgentWorker, HandlerOutcome, WorkerConfig};
pub use dispatcher::{DispatchOutcome, DispatchReport, Dispatcher, DispatcherConfig};
pub use errors::{CollaboratorFailure, MeshError, Result};
pub use escalation::{OperatorChannel, OperatorNotice};
pub use incident::{Incident, IncidentSignature, IncidentUpdate, Severity, SignalType};
pub use monitoring::{HealthSignal, Monitor, MonitorConfig, SignalConfig};
pub use orchestrator::{LanguageModel, Orchestrator, OrchestratorConfig};
pub use queue::{AckToken, Delivery, FabricConfig, QueueFabric};
pub use registry::{AgentHealth, AgentRegistration, AgentRegistry, RegistryConfig};
pub use repair::{RepairAction, RepairAgent, RepairConfig, RepairOperation, RepairState};
pub use routing::{MatchPredicate, RouteDecision, RouteOutcome, RoutingRule, RoutingTable};
pub use status::{StatusBoard, StatusSink, StatusUpdate, TaskRecord};
pub use task::{Task, TaskKind, TaskStatus};
pub use telemetry::{MeshObserver, NoopObserver};
