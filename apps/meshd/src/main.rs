mod config;
mod metrics;
mod routes;
mod task_log;

use std::sync::Arc;
use std::time::Duration;

use agentmesh::dispatcher::HttpForwarder;
use agentmesh::escalation::{LogChannel, WebhookChannel};
use agentmesh::journal::FileJournal;
use agentmesh::orchestrator::OpenAiClient;
use agentmesh::registry::HttpHealthChecker;
use agentmesh::repair::{ActionLedger, CommandExecutor};
use agentmesh::{
    AgentHandler, AgentRegistry, AgentWorker, Dispatcher, DispatcherConfig, FabricConfig,
    HealthSignal, Monitor, MonitorConfig, OperatorChannel, Orchestrator, OrchestratorConfig,
    QueueFabric, RepairAgent, RepairConfig, StatusBoard, WorkerConfig,
};
use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{dispatcher, error, info, warn};
use tracing_subscriber::prelude::*;

use crate::config::Settings;
use crate::metrics::MeshMetrics;
use crate::routes::AppState;
use crate::task_log::TaskLog;

const COMPACTION_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let settings = Settings::from_env()?;
    let metrics = Arc::new(MeshMetrics::new()?);
    let board = Arc::new(StatusBoard::default());
    let fabric = Arc::new(
        build_fabric(&settings)?
            .with_status_sink(board.clone())
            .with_observer(metrics.clone()),
    );

    let registry = Arc::new(
        AgentRegistry::default()
            .with_checker(Arc::new(HttpHealthChecker::new(Duration::from_secs(5))?)),
    );
    let dispatcher = Arc::new(
        Dispatcher::new(
            DispatcherConfig::default(),
            settings.routing_table()?,
            registry.clone(),
            fabric.clone(),
        )?
        .with_status_sink(board.clone())
        .with_direct_transport(Arc::new(HttpForwarder::new(Duration::from_secs(30))?))
        .with_observer(metrics.clone()),
    );

    let channel = build_channel(&settings)?;
    let monitor = Arc::new(
        Monitor::new(
            MonitorConfig::default()
                .with_interval(settings.monitor_interval)
                .with_probe_timeout(settings.probe_timeout),
            build_signals(&settings)?,
            fabric.clone(),
            channel.clone(),
        )
        .with_status_sink(board.clone())
        .with_observer(metrics.clone()),
    );
    let executor = CommandExecutor::new(
        settings.repair_allowed_programs.clone(),
        settings.repair_commands.clone(),
        settings.repair_command_timeout,
    )?;
    if settings.repair_commands.is_empty() {
        warn!("REPAIR_COMMANDS is empty; every repair will fail and escalate");
    }
    let repair = Arc::new(
        RepairAgent::new(
            RepairConfig::default()
                .with_max_attempts(settings.repair_max_attempts)
                .with_approval_timeout(settings.approval_timeout),
            Arc::new(executor),
            monitor.clone(),
            channel.clone(),
        )
        .with_ledger(build_ledger(&settings)?)
        .with_observer(metrics.clone()),
    );
    let orchestrator = Arc::new(build_orchestrator(&settings)?);

    let task_log = match &settings.database_url {
        Some(url) => Some(TaskLog::connect(url, settings.database_max_connections).await?),
        None => None,
    };

    let shutdown = CancellationToken::new();
    let mut background = JoinSet::new();
    background.spawn(dispatcher.clone().run(shutdown.clone()));
    background.spawn(monitor.clone().run(shutdown.clone()));
    let handlers: [Arc<dyn AgentHandler>; 3] = [repair.clone(), monitor.clone(), orchestrator];
    for handler in handlers {
        let worker = AgentWorker::new(
            handler,
            fabric.clone(),
            registry.clone(),
            board.clone(),
            WorkerConfig::default().with_inbox(dispatcher.inbox()),
        );
        let token = shutdown.clone();
        background.spawn(async move {
            if let Err(err) = worker.run(token).await {
                error!(agent = %worker.agent_id(), "agent worker stopped: {err}");
            }
        });
    }
    if let Some(log) = task_log.clone() {
        background.spawn(log.mirror(board.subscribe(), shutdown.clone()));
    }
    if settings.journal_path.is_some() {
        background.spawn(compact_periodically(fabric.clone(), shutdown.clone()));
    }

    let state = AppState {
        fabric,
        board,
        dispatcher,
        monitor,
        repair,
        metrics,
        task_log,
        rules_path: settings.routing_rules.clone(),
    };
    let app = routes::router(state);

    let listener = TcpListener::bind(settings.bind_addr).await?;
    info!(bind_addr = %settings.bind_addr, "server starting");
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    while let Some(joined) = background.join_next().await {
        if let Err(err) = joined {
            error!("background task panicked: {err}");
        }
    }
    info!("server stopped");
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    if dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn build_fabric(settings: &Settings) -> anyhow::Result<QueueFabric> {
    let config = FabricConfig::default()
        .with_visibility_timeout(settings.visibility_timeout)
        .with_max_attempts(settings.max_attempts)
        .with_redelivery_delay(settings.redelivery_delay, settings.max_redelivery_delay)
        .with_dead_letter_capacity(settings.dead_letter_capacity);
    match &settings.journal_path {
        Some(path) => {
            let journal = FileJournal::open(path)?;
            info!(path = %path.display(), "replaying queue journal");
            Ok(QueueFabric::open(config, Arc::new(journal))?)
        }
        None => {
            warn!("MESH_JOURNAL_PATH is unset; queued tasks will not survive a restart");
            Ok(QueueFabric::new(config))
        }
    }
}

fn build_ledger(settings: &Settings) -> anyhow::Result<Arc<ActionLedger>> {
    match &settings.repair_ledger_path {
        Some(path) => {
            let ledger = ActionLedger::open(path, settings.repair_ledger_retention)
                .with_context(|| format!("failed to open repair ledger {}", path.display()))?;
            Ok(Arc::new(ledger))
        }
        None => {
            warn!("REPAIR_LEDGER_PATH is unset; applied repairs are forgotten on restart");
            Ok(Arc::new(ActionLedger::new()))
        }
    }
}

fn build_channel(settings: &Settings) -> anyhow::Result<Arc<dyn OperatorChannel>> {
    let channel: Arc<dyn OperatorChannel> = match &settings.operator_webhook_url {
        Some(url) => Arc::new(WebhookChannel::new(
            url.clone(),
            settings.operator_recipient.clone(),
            Duration::from_secs(10),
        )?),
        None => {
            info!("OPERATOR_WEBHOOK_URL is unset; operator notices go to the log");
            Arc::new(LogChannel)
        }
    };
    Ok(channel)
}

fn build_signals(settings: &Settings) -> anyhow::Result<Vec<Arc<dyn HealthSignal>>> {
    let http = reqwest::Client::builder()
        .timeout(settings.probe_timeout)
        .build()?;
    let signals = settings
        .signals
        .iter()
        .cloned()
        .map(|signal| signal.build(&http, settings.probe_timeout))
        .collect::<agentmesh::Result<Vec<_>>>()?;
    if signals.is_empty() {
        warn!("MONITOR_SIGNALS is empty; monitoring will never open incidents");
    }
    Ok(signals)
}

fn build_orchestrator(settings: &Settings) -> anyhow::Result<Orchestrator> {
    let model = OpenAiClient::new(
        settings.llm_endpoint.clone(),
        settings.llm_model.clone(),
        settings.llm_api_key.clone(),
        settings.llm_timeout,
    )?;
    let mut config = OrchestratorConfig::default().with_timeout(settings.llm_timeout);
    if let Some(prompt) = &settings.system_prompt {
        config = config.with_system_prompt(prompt.clone());
    }
    Ok(Orchestrator::new(config, Arc::new(model)))
}

async fn compact_periodically(fabric: Arc<QueueFabric>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(COMPACTION_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match fabric.compact() {
                Ok(records) => info!(records, "queue journal compacted"),
                Err(err) => warn!("queue journal compaction failed: {err}"),
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
