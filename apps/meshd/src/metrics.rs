use std::time::Duration;

use agentmesh::incident::IncidentSignature;
use agentmesh::repair::RepairState;
use agentmesh::MeshObserver;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub struct MeshMetrics {
    registry: Registry,
    routed: IntCounterVec,
    route_latency: HistogramVec,
    dead_lettered: IntCounterVec,
    incidents: IntCounterVec,
    repairs: IntCounterVec,
    queue_depth: IntGaugeVec,
}

impl MeshMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("agentmesh".to_string()), None)?;
        let routed = IntCounterVec::new(
            Opts::new("tasks_routed_total", "Tasks handed to an agent, by target"),
            &["target"],
        )?;
        let route_latency = HistogramVec::new(
            HistogramOpts::new(
                "route_duration_seconds",
                "Time from dispatch start to hand-off, by target",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["target"],
        )?;
        let dead_lettered = IntCounterVec::new(
            Opts::new(
                "tasks_dead_lettered_total",
                "Tasks parked on the dead-letter queue, by reason",
            ),
            &["reason"],
        )?;
        let incidents = IntCounterVec::new(
            Opts::new("incidents_opened_total", "Incidents opened by monitoring"),
            &["signal_type", "component"],
        )?;
        let repairs = IntCounterVec::new(
            Opts::new("repairs_finished_total", "Repair runs by final state"),
            &["state"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Messages per queue, by readiness"),
            &["queue", "state"],
        )?;
        registry.register(Box::new(routed.clone()))?;
        registry.register(Box::new(route_latency.clone()))?;
        registry.register(Box::new(dead_lettered.clone()))?;
        registry.register(Box::new(incidents.clone()))?;
        registry.register(Box::new(repairs.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        Ok(Self {
            registry,
            routed,
            route_latency,
            dead_lettered,
            incidents,
            repairs,
            queue_depth,
        })
    }

    pub fn record_depth(&self, queue: &str, ready: usize, in_flight: usize) {
        self.queue_depth
            .with_label_values(&[queue, "ready"])
            .set(ready as i64);
        self.queue_depth
            .with_label_values(&[queue, "in_flight"])
            .set(in_flight as i64);
    }

    pub fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MeshObserver for MeshMetrics {
    fn task_routed(&self, target: &str, elapsed: Duration) {
        self.routed.with_label_values(&[target]).inc();
        self.route_latency
            .with_label_values(&[target])
            .observe(elapsed.as_secs_f64());
    }

    fn task_dead_lettered(&self, reason: &str) {
        self.dead_lettered.with_label_values(&[reason]).inc();
    }

    fn incident_opened(&self, signature: &IncidentSignature) {
        self.incidents
            .with_label_values(&[
                &signature.signal_type.to_string(),
                signature.affected_component.as_str(),
            ])
            .inc();
    }

    fn repair_finished(&self, state: RepairState) {
        self.repairs.with_label_values(&[state.as_str()]).inc();
    }
}
