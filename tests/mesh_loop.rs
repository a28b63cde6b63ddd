use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmesh::escalation::{MemoryChannel, NoticeKind};
use agentmesh::incident::{Severity, SignalType};
use agentmesh::monitoring::{SignalSpec, Threshold};
use agentmesh::orchestrator::ChatReply;
use agentmesh::repair::MemoryExecutor;
use agentmesh::{
    HealthSignal, MatchPredicate, Monitor, MonitorConfig, Orchestrator, OrchestratorConfig,
    RepairAgent, RepairConfig, RepairOperation, RoutingRule, RoutingTable, Task, TaskKind,
    TaskStatus,
};
use anyhow::Result;
use integration_tests::support::{eventually, EchoModel, Mesh, ToggleSignal};
use serde_json::json;

fn table() -> Result<RoutingTable> {
    Ok(RoutingTable::new(vec![
        RoutingRule::new("incidents", MatchPredicate::kind("incident"), "repair"),
        RoutingRule::new("incident-updates", MatchPredicate::kind("incident_update"), "monitoring"),
        RoutingRule::new("chat", MatchPredicate::kind("chat"), "orchestrator"),
    ])?)
}

fn gateway_signal(up: Arc<AtomicBool>) -> Arc<dyn HealthSignal> {
    Arc::new(ToggleSignal::new(
        SignalSpec::new(
            "gateway-liveness",
            "gateway",
            SignalType::ProcessDown,
            Threshold::Unhealthy,
        )
        .with_consecutive(1)
        .with_severity(Severity::High),
        up,
    ))
}

#[tokio::test]
async fn chat_round_trip_through_running_loops() -> Result<()> {
    let mut mesh = Mesh::start(table()?)?;
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), Arc::new(EchoModel));
    mesh.spawn_agent(Arc::new(orchestrator))?;
    mesh.fabric.declare("frontend")?;

    let chat = Task::new(TaskKind::Chat, json!({ "text": "ping", "session_id": "s-1" }), "frontend")
        .with_reply_to("frontend");
    mesh.board.track(&chat)?;
    mesh.dispatcher.submit(chat.clone())?;

    let delivery = mesh
        .fabric
        .consume("frontend", Duration::from_secs(5))
        .await?
        .expect("reply published to the requester");
    mesh.fabric.acknowledge(&delivery.token)?;
    assert_eq!(delivery.task.kind, TaskKind::ChatReply);
    assert_eq!(delivery.task.correlation_id, Some(chat.id));
    let reply: ChatReply = serde_json::from_value(delivery.task.payload)?;
    assert_eq!(reply.reply_text, "echo: ping");
    assert_eq!(reply.session_id, "s-1");
    assert!(!reply.degraded);

    let board = mesh.board.clone();
    let id = chat.id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let board = board.clone();
            async move { board.get(&id).map(|record| record.status) == Some(TaskStatus::Completed) }
        })
        .await
    );
    let record = mesh.board.get(&chat.id).expect("tracked");
    assert_eq!(record.assigned_to.as_deref(), Some("orchestrator"));

    mesh.stop().await;
    Ok(())
}

#[tokio::test]
async fn outage_is_repaired_and_closed_without_an_operator() -> Result<()> {
    let mut mesh = Mesh::start(table()?)?;
    let up = Arc::new(AtomicBool::new(false));
    let channel = Arc::new(MemoryChannel::new());
    let monitor = Arc::new(Monitor::new(
        MonitorConfig::default().with_probe_retries(0),
        vec![gateway_signal(up.clone())],
        mesh.fabric.clone(),
        channel.clone(),
    ));
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
    mesh.spawn_agent(repair.clone())?;
    mesh.spawn_agent(monitor.clone())?;

    let opened = monitor.tick().await.opened;
    assert_eq!(opened.len(), 1);
    let incident_id = opened[0].id;

    let watched = monitor.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let watched = watched.clone();
            async move { watched.open_incidents().is_empty() }
        })
        .await,
        "incident should close after a verified repair"
    );

    let ledger = repair.ledger().entries(&incident_id);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].operation, RepairOperation::RestartProcess);
    assert_eq!(executor.applied().len(), 1);
    assert_eq!(channel.count(NoticeKind::RepairSummary), 1);
    assert_eq!(channel.count(NoticeKind::Escalation), 0);

    // Healthy again: no new incident.
    assert!(monitor.tick().await.opened.is_empty());
    mesh.stop().await;
    Ok(())
}

#[tokio::test]
async fn persistent_outage_escalates_to_the_operator() -> Result<()> {
    let mut mesh = Mesh::start(table()?)?;
    let up = Arc::new(AtomicBool::new(false));
    let channel = Arc::new(MemoryChannel::new());
    let monitor = Arc::new(Monitor::new(
        MonitorConfig::default().with_probe_retries(0),
        vec![gateway_signal(up)],
        mesh.fabric.clone(),
        channel.clone(),
    ));
    let executor = Arc::new(MemoryExecutor::new());
    let repair = Arc::new(RepairAgent::new(
        RepairConfig::default()
            .with_verify_delay(Duration::ZERO)
            .with_approval_timeout(Duration::from_millis(50)),
        executor.clone(),
        monitor.clone(),
        channel.clone(),
    ));
    mesh.spawn_agent(repair.clone())?;
    mesh.spawn_agent(monitor.clone())?;

    let opened = monitor.tick().await.opened;
    assert_eq!(opened.len(), 1);

    let watched = monitor.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let watched = watched.clone();
            async move {
                watched
                    .open_incidents()
                    .first()
                    .map(|open| open.escalated)
                    .unwrap_or(false)
            }
        })
        .await,
        "incident should be marked escalated"
    );

    // The restart failed verification and was rolled back; the follow-up
    // guard needed approval that never came.
    assert_eq!(executor.applied().len(), 1);
    assert_eq!(executor.rolled_back().len(), 1);
    assert_eq!(channel.count(NoticeKind::ApprovalRequest), 1);
    assert_eq!(channel.count(NoticeKind::Escalation), 1);
    assert!(repair.is_escalated(&opened[0]));

    // Still down, but the open incident suppresses duplicates.
    assert!(monitor.tick().await.opened.is_empty());
    mesh.stop().await;
    Ok(())
}
