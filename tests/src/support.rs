use std::env;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmesh::backoff::RetryPolicy;
use agentmesh::monitoring::{HealthReading, SignalSpec};
use agentmesh::orchestrator::GenerationContext;
use agentmesh::{
    AgentHandler, AgentRegistry, AgentWorker, Dispatcher, DispatcherConfig, FabricConfig,
    HealthSignal, LanguageModel, QueueFabric, RoutingTable, StatusBoard, WorkerConfig,
};
use anyhow::Result;
use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempdir()?)
}

pub fn system_path() -> String {
    env::var("PATH").unwrap_or_else(|_| {
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
    })
}

/// Fabric, board, registry and a running dispatcher loop, plus whatever
/// agent workers a test starts.
pub struct Mesh {
    pub board: Arc<StatusBoard>,
    pub fabric: Arc<QueueFabric>,
    pub registry: Arc<AgentRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    loops: JoinSet<()>,
}

impl Mesh {
    pub fn start(table: RoutingTable) -> Result<Self> {
        let board = Arc::new(StatusBoard::default());
        let fabric = Arc::new(
            QueueFabric::new(FabricConfig::default().with_poll_interval(Duration::from_millis(5)))
                .with_status_sink(board.clone()),
        );
        let registry = Arc::new(AgentRegistry::default());
        let dispatcher = Arc::new(
            Dispatcher::new(
                DispatcherConfig::default()
                    .with_consume_timeout(Duration::from_millis(50))
                    .with_target_retry(RetryPolicy::new(3, Duration::from_millis(20))),
                table,
                registry.clone(),
                fabric.clone(),
            )?
            .with_status_sink(board.clone()),
        );
        let shutdown = CancellationToken::new();
        let mut loops = JoinSet::new();
        loops.spawn(dispatcher.clone().run(shutdown.clone()));
        Ok(Self {
            board,
            fabric,
            registry,
            dispatcher,
            shutdown,
            loops,
        })
    }

    /// Registers the handler before returning so routing never races it.
    pub fn spawn_agent(&mut self, handler: Arc<dyn AgentHandler>) -> Result<()> {
        let worker = AgentWorker::new(
            handler,
            self.fabric.clone(),
            self.registry.clone(),
            self.board.clone(),
            WorkerConfig::default().with_consume_timeout(Duration::from_millis(50)),
        );
        worker.register()?;
        let token = self.shutdown.clone();
        self.loops.spawn(async move {
            let _ = worker.run(token).await;
        });
        Ok(())
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        while self.loops.join_next().await.is_some() {}
    }
}

/// Polls `check` until it holds or `within` passes.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Liveness flag a test flips by hand.
pub struct ToggleSignal {
    spec: SignalSpec,
    up: Arc<AtomicBool>,
}

impl ToggleSignal {
    pub fn new(spec: SignalSpec, up: Arc<AtomicBool>) -> Self {
        Self { spec, up }
    }
}

#[async_trait]
impl HealthSignal for ToggleSignal {
    fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    async fn read(&self) -> agentmesh::Result<HealthReading> {
        let up = self.up.load(Ordering::SeqCst);
        Ok(HealthReading::flag(up, if up { "responding" } else { "not responding" }))
    }
}

/// Answers every prompt by echoing the last user message.
pub struct EchoModel;

#[async_trait]
impl LanguageModel for EchoModel {
    async fn generate(&self, context: &GenerationContext) -> agentmesh::Result<String> {
        let last = context
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        Ok(format!("echo: {last}"))
    }
}
