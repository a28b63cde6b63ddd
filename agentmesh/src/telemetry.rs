use std::time::Duration;

use crate::incident::IncidentSignature;
use crate::repair::RepairState;

/// Hook for counting what flows through the core. The binary backs this with
/// Prometheus; every method defaults to a no-op.
pub trait MeshObserver: Send + Sync {
    fn task_routed(&self, _target: &str, _elapsed: Duration) {}

    fn task_dead_lettered(&self, _reason: &str) {}

    fn incident_opened(&self, _signature: &IncidentSignature) {}

    fn repair_finished(&self, _state: RepairState) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl MeshObserver for NoopObserver {}
