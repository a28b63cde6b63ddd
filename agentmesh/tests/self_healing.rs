//! End-to-end scenarios across fabric, dispatcher, monitoring and repair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentmesh::agent::{AgentWorker, Disposition, WorkerConfig};
use agentmesh::backoff::RetryPolicy;
use agentmesh::dispatcher::{
    DiagnosticKind, DispatchOutcome, Dispatcher, DispatcherConfig, DISPATCHER_INBOX,
};
use agentmesh::escalation::{MemoryChannel, NoticeKind};
use agentmesh::incident::{Incident, Severity, SignalType};
use agentmesh::journal::FileJournal;
use agentmesh::monitoring::{
    HealthReading, HealthSignal, Monitor, MonitorConfig, SignalSpec, Threshold,
};
use agentmesh::queue::{FabricConfig, QueueFabric, DEAD_LETTER_QUEUE};
use agentmesh::registry::AgentRegistry;
use agentmesh::repair::{
    ActionLedger, MemoryExecutor, RepairAgent, RepairConfig, RepairOperation, RepairState,
};
use agentmesh::routing::{MatchPredicate, RouteOutcome, RoutingRule, RoutingTable};
use agentmesh::status::StatusBoard;
use agentmesh::task::{reasons, Task, TaskKind, TaskStatus};
use agentmesh::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct GatewayLiveness {
    spec: SignalSpec,
    up: Arc<AtomicBool>,
}

#[async_trait]
impl HealthSignal for GatewayLiveness {
    fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    async fn read(&self) -> Result<HealthReading> {
        let up = self.up.load(Ordering::SeqCst);
        Ok(HealthReading::flag(
            up,
            if up { "GET /health -> 200" } else { "GET /health failed: connection refused" },
        ))
    }
}

fn open_fabric(path: &Path) -> QueueFabric {
    let journal = FileJournal::open(path).unwrap();
    QueueFabric::open(FabricConfig::default(), Arc::new(journal)).unwrap()
}

async fn pump(dispatcher: &Dispatcher, fabric: &QueueFabric) -> Vec<DispatchOutcome> {
    let mut outcomes = Vec::new();
    while let Some(delivery) = fabric.try_consume(DISPATCHER_INBOX).unwrap() {
        outcomes.push(dispatcher.dispatch(delivery.task).await.unwrap().outcome);
        fabric.acknowledge(&delivery.token).unwrap();
    }
    outcomes
}

#[tokio::test]
async fn gateway_down_is_restarted_verified_and_closed() {
    let board = Arc::new(StatusBoard::default());
    let fabric = Arc::new(
        QueueFabric::new(FabricConfig::default().with_poll_interval(Duration::from_millis(5)))
            .with_status_sink(board.clone()),
    );
    let registry = Arc::new(AgentRegistry::default());
    let table = RoutingTable::new(vec![
        RoutingRule::new("incidents", MatchPredicate::kind("incident"), "repair"),
        RoutingRule::new("incident-updates", MatchPredicate::kind("incident_update"), "monitoring"),
    ])
    .unwrap();
    let dispatcher = Dispatcher::new(
        DispatcherConfig::default()
            .with_target_retry(RetryPolicy::new(0, Duration::from_millis(1))),
        table,
        registry.clone(),
        fabric.clone(),
    )
    .unwrap()
    .with_status_sink(board.clone());

    let up = Arc::new(AtomicBool::new(false));
    let signal: Arc<dyn HealthSignal> = Arc::new(GatewayLiveness {
        spec: SignalSpec::new(
            "gateway-liveness",
            "gateway",
            SignalType::ProcessDown,
            Threshold::Unhealthy,
        )
        .with_consecutive(2)
        .with_severity(Severity::High),
        up: up.clone(),
    });
    let channel = Arc::new(MemoryChannel::new());
    let monitor = Arc::new(
        Monitor::new(
            MonitorConfig::default().with_probe_retries(0),
            vec![signal],
            fabric.clone(),
            channel.clone(),
        )
        .with_status_sink(board.clone()),
    );
    let restarted = up.clone();
    let executor = Arc::new(
        MemoryExecutor::new().with_hook(move |_| restarted.store(true, Ordering::SeqCst)),
    );
    let repair = Arc::new(RepairAgent::new(
        RepairConfig::default().with_verify_delay(Duration::ZERO),
        executor.clone(),
        monitor.clone(),
        channel.clone(),
    ));

    let worker_config = WorkerConfig::default().with_consume_timeout(Duration::from_millis(50));
    let repair_worker = AgentWorker::new(
        repair.clone(),
        fabric.clone(),
        registry.clone(),
        board.clone(),
        worker_config.clone(),
    );
    let monitor_worker = AgentWorker::new(
        monitor.clone(),
        fabric.clone(),
        registry.clone(),
        board.clone(),
        worker_config,
    );
    repair_worker.register().unwrap();
    monitor_worker.register().unwrap();
    let shutdown = CancellationToken::new();

    assert!(monitor.tick().await.opened.is_empty());
    let opened = monitor.tick().await.opened;
    assert_eq!(opened.len(), 1);
    let incident: Incident = opened[0].clone();

    let routed = pump(&dispatcher, &fabric).await;
    assert!(matches!(&routed[0], DispatchOutcome::Queued { target, .. } if target == "repair"));

    let report = repair_worker.process_one(&shutdown).await.unwrap().unwrap();
    assert_eq!(report.disposition, Disposition::Completed);
    assert_eq!(board.get(&report.task_id).unwrap().status, TaskStatus::Completed);

    let routed = pump(&dispatcher, &fabric).await;
    assert!(matches!(&routed[0], DispatchOutcome::Queued { target, .. } if target == "monitoring"));
    let report = monitor_worker.process_one(&shutdown).await.unwrap().unwrap();
    assert_eq!(report.disposition, Disposition::Completed);

    assert!(monitor.open_incidents().is_empty());
    let ledger = repair.ledger().entries(&incident.id);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].operation, RepairOperation::RestartProcess);
    assert!(!ledger[0].rolled_back);
    assert_eq!(executor.applied().len(), 1);
    assert_eq!(channel.count(NoticeKind::RepairSummary), 1);
    assert_eq!(channel.count(NoticeKind::Escalation), 0);
}

#[tokio::test]
async fn unknown_kind_with_empty_table_is_dead_lettered() {
    let board = Arc::new(StatusBoard::default());
    let fabric =
        Arc::new(QueueFabric::new(FabricConfig::default()).with_status_sink(board.clone()));
    let dispatcher = Dispatcher::new(
        DispatcherConfig::default(),
        RoutingTable::empty(),
        Arc::new(AgentRegistry::default()),
        fabric.clone(),
    )
    .unwrap()
    .with_status_sink(board.clone());

    let task = Task::new("unknown_kind", json!({ "anything": true }), "frontend");
    board.track(&task).unwrap();
    assert_eq!(dispatcher.route(&task), RouteOutcome::NoRoute);

    let report = dispatcher.dispatch(task.clone()).await.unwrap();
    assert_eq!(
        report.outcome,
        DispatchOutcome::DeadLettered {
            reason: reasons::NO_MATCHING_RULE.to_string()
        }
    );
    let record = board.get(&task.id).unwrap();
    assert_eq!(record.status, TaskStatus::DeadLettered);
    assert_eq!(record.reason.as_deref(), Some(reasons::NO_MATCHING_RULE));

    let parked = fabric.peek(DEAD_LETTER_QUEUE, 10).unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].id, task.id);
    assert_eq!(parked[0].kind, TaskKind::from("unknown_kind"));
    assert_eq!(dispatcher.diagnostics(1)[0].kind, DiagnosticKind::NoRoute);
}

#[tokio::test]
async fn unacknowledged_task_is_redelivered_until_capped() {
    let fabric = QueueFabric::new(
        FabricConfig::default()
            .with_visibility_timeout(Duration::from_millis(20))
            .with_max_attempts(3)
            .with_poll_interval(Duration::from_millis(5)),
    );
    fabric.declare("work").unwrap();
    let task = Task::new(TaskKind::HealthProbe, json!({}), "scheduler");
    fabric.publish("work", task.clone()).unwrap();

    for expected in 0..3 {
        let delivery = fabric
            .consume("work", Duration::from_millis(500))
            .await
            .unwrap()
            .expect("redelivered after the visibility timeout");
        assert_eq!(delivery.task.id, task.id);
        assert_eq!(delivery.task.attempts, expected);
    }
    assert!(fabric.consume("work", Duration::from_millis(100)).await.unwrap().is_none());

    let buried = fabric.peek(DEAD_LETTER_QUEUE, 10).unwrap();
    assert_eq!(buried.len(), 1);
    assert_eq!(buried[0].attempts, 3);
    assert_eq!(buried[0].status, TaskStatus::DeadLettered);
    assert_eq!(buried[0].status_reason.as_deref(), Some(reasons::MAX_ATTEMPTS_EXCEEDED));
}

#[tokio::test]
async fn published_tasks_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal").join("fabric.jsonl");
    let kept = Task::new(
        TaskKind::Chat,
        json!({ "text": "hello", "session_id": "s1" }),
        "frontend",
    );
    {
        let fabric = open_fabric(&path);
        fabric.declare("orchestrator").unwrap();
        let done = Task::new(TaskKind::Chat, json!({ "text": "done" }), "frontend");
        fabric.publish("orchestrator", done).unwrap();
        fabric.publish("orchestrator", kept.clone()).unwrap();
        let finished = fabric.try_consume("orchestrator").unwrap().unwrap();
        fabric.acknowledge(&finished.token).unwrap();
        // Consumed but never acknowledged before the "crash".
        fabric.try_consume("orchestrator").unwrap().unwrap();
    }

    let reopened = open_fabric(&path);
    let depth = reopened.depth("orchestrator").unwrap();
    assert_eq!(depth.ready, 1);
    assert_eq!(depth.in_flight, 0);
    let delivery = reopened.try_consume("orchestrator").unwrap().unwrap();
    assert_eq!(delivery.task.id, kept.id);
    assert_eq!(delivery.task.attempts, 1);
}

fn liveness(name: &str, component: &str, up: &Arc<AtomicBool>) -> Arc<dyn HealthSignal> {
    Arc::new(GatewayLiveness {
        spec: SignalSpec::new(name, component, SignalType::ProcessDown, Threshold::Unhealthy)
            .with_consecutive(1),
        up: up.clone(),
    })
}

#[tokio::test]
async fn rate_limited_repair_is_escalated_once_its_task_is_dead_lettered() {
    let board = Arc::new(StatusBoard::default());
    let fabric = Arc::new(QueueFabric::new(
        FabricConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_max_attempts(3)
            .with_redelivery_delay(Duration::from_millis(10), Duration::from_millis(20)),
    ));
    let registry = Arc::new(AgentRegistry::default());
    let table = RoutingTable::new(vec![
        RoutingRule::new("incidents", MatchPredicate::kind("incident"), "repair"),
        RoutingRule::new("incident-updates", MatchPredicate::kind("incident_update"), "monitoring"),
    ])
    .unwrap();
    let dispatcher =
        Dispatcher::new(DispatcherConfig::default(), table, registry.clone(), fabric.clone())
            .unwrap();

    let up = Arc::new(AtomicBool::new(false));
    let channel = Arc::new(MemoryChannel::new());
    let monitor = Arc::new(Monitor::new(
        MonitorConfig::default().with_probe_retries(0),
        vec![
            liveness("cache-liveness", "cache", &up),
            liveness("gateway-liveness", "gateway", &up),
        ],
        fabric.clone(),
        channel.clone(),
    ));
    let restarted = up.clone();
    let executor = Arc::new(
        MemoryExecutor::new().with_hook(move |_| restarted.store(true, Ordering::SeqCst)),
    );
    let repair = Arc::new(RepairAgent::new(
        RepairConfig::default()
            .with_verify_delay(Duration::ZERO)
            .with_rate_limit(1, Duration::from_secs(3600)),
        executor.clone(),
        monitor.clone(),
        channel.clone(),
    ));
    let worker_config = WorkerConfig::default().with_consume_timeout(Duration::from_millis(50));
    let repair_worker = AgentWorker::new(
        repair,
        fabric.clone(),
        registry.clone(),
        board.clone(),
        worker_config.clone(),
    );
    let monitor_worker =
        AgentWorker::new(monitor.clone(), fabric.clone(), registry.clone(), board, worker_config);
    repair_worker.register().unwrap();
    monitor_worker.register().unwrap();

    let opened = monitor.tick().await.opened;
    assert_eq!(opened.len(), 2);
    let shutdown = CancellationToken::new();
    let monitoring = tokio::spawn(monitor.clone().run(shutdown.clone()));
    pump(&dispatcher, &fabric).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while fabric.depth(DEAD_LETTER_QUEUE).unwrap().ready == 0 {
        assert!(Instant::now() < deadline, "rate-limited incident was never dead-lettered");
        repair_worker.process_one(&shutdown).await.unwrap();
    }
    while channel.count(NoticeKind::Escalation) == 0 {
        assert!(Instant::now() < deadline, "dead-lettered incident was never escalated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let buried = fabric.peek(DEAD_LETTER_QUEUE, 1).unwrap().remove(0);
    assert_eq!(buried.status_reason.as_deref(), Some(reasons::MAX_ATTEMPTS_EXCEEDED));
    let stuck = Incident::from_task(&buried).unwrap();
    assert_eq!(executor.applied().len(), 1);

    pump(&dispatcher, &fabric).await;
    while monitor_worker.process_one(&shutdown).await.unwrap().is_some() {}
    let open = monitor.open_incidents();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].incident.id, stuck.id);
    assert!(open[0].escalated);
    assert_eq!(channel.count(NoticeKind::Escalation), 1);

    shutdown.cancel();
    monitoring.await.unwrap();
}

#[tokio::test]
async fn replayed_incident_is_not_repaired_twice_after_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("fabric.jsonl");
    let ledger = dir.path().join("repair-ledger.jsonl");
    let retention = Duration::from_secs(3600);
    let up = Arc::new(AtomicBool::new(false));
    let restarted = up.clone();
    let executor = Arc::new(
        MemoryExecutor::new().with_hook(move |_| restarted.store(true, Ordering::SeqCst)),
    );
    let incident = Incident::new(
        "gateway-liveness",
        SignalType::ProcessDown,
        "gateway",
        Severity::High,
        "down",
    );
    let token = CancellationToken::new();

    let boot = || {
        let fabric = Arc::new(open_fabric(&journal));
        let monitor = Arc::new(Monitor::new(
            MonitorConfig::default().with_probe_retries(0),
            vec![liveness("gateway-liveness", "gateway", &up)],
            fabric.clone(),
            Arc::new(MemoryChannel::new()),
        ));
        let repair = RepairAgent::new(
            RepairConfig::default().with_verify_delay(Duration::ZERO),
            executor.clone(),
            monitor,
            Arc::new(MemoryChannel::new()),
        )
        .with_ledger(Arc::new(ActionLedger::open(&ledger, retention).unwrap()));
        (fabric, repair)
    };

    {
        let (fabric, repair) = boot();
        fabric.declare("repair").unwrap();
        fabric.publish("repair", incident.to_task("monitoring").unwrap()).unwrap();
        let delivery = fabric.try_consume("repair").unwrap().unwrap();
        let (run, _) = repair
            .repair(Incident::from_task(&delivery.task).unwrap(), &token)
            .await
            .unwrap();
        assert_eq!(run.state(), RepairState::Completed);
        // Stopped before the delivery was acknowledged.
    }

    let (fabric, repair) = boot();
    let delivery = fabric.try_consume("repair").unwrap().unwrap();
    assert_eq!(delivery.task.attempts, 1);
    let (run, _) = repair
        .repair(Incident::from_task(&delivery.task).unwrap(), &token)
        .await
        .unwrap();
    assert_eq!(run.state(), RepairState::Completed);
    assert_eq!(executor.applied().len(), 1);
    assert_eq!(repair.ledger().applied_count(&incident.id), 1);
}
