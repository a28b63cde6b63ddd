use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentHandler, HandlerOutcome};
use crate::dispatcher::DISPATCHER_INBOX;
use crate::errors::{MeshError, Result};
use crate::escalation::{notify_or_log, NoticeKind, OperatorChannel, OperatorNotice};
use crate::incident::{
    Incident, IncidentSignature, IncidentUpdate, Resolution, Severity, SignalType,
};
use crate::queue::QueueFabric;
use crate::registry::AgentRegistration;
use crate::repair::{VerificationResult, Verifier};
use crate::status::{StatusSink, StatusUpdate};
use crate::task::{Task, TaskKind};
use crate::telemetry::{MeshObserver, NoopObserver};

const EVIDENCE_LINES: usize = 5;
const EVIDENCE_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reading {
    Numeric(f64),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReading {
    pub value: Reading,
    pub evidence: String,
}

impl HealthReading {
    pub fn numeric(value: f64, evidence: impl Into<String>) -> Self {
        Self {
            value: Reading::Numeric(value),
            evidence: evidence.into(),
        }
    }

    pub fn flag(value: bool, evidence: impl Into<String>) -> Self {
        Self {
            value: Reading::Flag(value),
            evidence: evidence.into(),
        }
    }
}

/// When a reading counts as a breach. Flags breach when false under every
/// variant; `unhealthy` treats any non-zero number as a breach.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Threshold {
    Above(f64),
    Below(f64),
    Unhealthy,
}

impl Threshold {
    pub fn breached(&self, reading: Reading) -> bool {
        match (self, reading) {
            (_, Reading::Flag(ok)) => !ok,
            (Threshold::Above(limit), Reading::Numeric(value)) => value > *limit,
            (Threshold::Below(limit), Reading::Numeric(value)) => value < *limit,
            (Threshold::Unhealthy, Reading::Numeric(value)) => value != 0.0,
        }
    }
}

fn default_consecutive() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalSpec {
    pub name: String,
    pub component: String,
    pub signal_type: SignalType,
    pub threshold: Threshold,
    /// Consecutive breached samples before an incident opens.
    #[serde(default = "default_consecutive")]
    pub consecutive: u32,
    #[serde(default)]
    pub severity: Severity,
}

impl SignalSpec {
    pub fn new(
        name: impl Into<String>,
        component: impl Into<String>,
        signal_type: SignalType,
        threshold: Threshold,
    ) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            signal_type,
            threshold,
            consecutive: default_consecutive(),
            severity: Severity::default(),
        }
    }

    pub fn with_consecutive(mut self, consecutive: u32) -> Self {
        self.consecutive = consecutive.max(1);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn signature(&self) -> IncidentSignature {
        IncidentSignature::new(self.signal_type, self.component.clone())
    }
}

/// Operator-configured source of health readings.
#[async_trait]
pub trait HealthSignal: Send + Sync {
    fn spec(&self) -> &SignalSpec;

    async fn read(&self) -> Result<HealthReading>;
}

/// Up when the URL answers with a success status.
pub struct HttpLivenessSignal {
    spec: SignalSpec,
    url: String,
    http: reqwest::Client,
}

impl HttpLivenessSignal {
    pub fn new(spec: SignalSpec, url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            spec,
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl HealthSignal for HttpLivenessSignal {
    fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    async fn read(&self) -> Result<HealthReading> {
        match self.http.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                Ok(HealthReading::flag(
                    status.is_success(),
                    format!("GET {} -> {status}", self.url),
                ))
            }
            Err(err) => Ok(HealthReading::flag(
                false,
                format!("GET {} failed: {err}", self.url),
            )),
        }
    }
}

/// Response time of a GET in milliseconds.
pub struct HttpLatencySignal {
    spec: SignalSpec,
    url: String,
    http: reqwest::Client,
}

impl HttpLatencySignal {
    pub fn new(spec: SignalSpec, url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            spec,
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl HealthSignal for HttpLatencySignal {
    fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    async fn read(&self) -> Result<HealthReading> {
        let started = Instant::now();
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|err| MeshError::Network(err.to_string()))?;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        Ok(HealthReading::numeric(
            elapsed,
            format!("GET {} -> {} in {elapsed:.1}ms", self.url, response.status()),
        ))
    }
}

/// Counts lines matching a pattern among those appended since the previous
/// read. The first read only records where the file ends.
pub struct LogPatternSignal {
    spec: SignalSpec,
    path: PathBuf,
    pattern: Regex,
    offset: Mutex<Option<u64>>,
}

impl LogPatternSignal {
    pub fn new(spec: SignalSpec, path: impl Into<PathBuf>, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|err| MeshError::InvalidOperation(format!("invalid log pattern: {err}")))?;
        Ok(Self {
            spec,
            path: path.into(),
            pattern,
            offset: Mutex::new(None),
        })
    }
}

#[async_trait]
impl HealthSignal for LogPatternSignal {
    fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    async fn read(&self) -> Result<HealthReading> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        let start = {
            let mut offset = self.offset.lock();
            match *offset {
                None => {
                    *offset = Some(len);
                    return Ok(HealthReading::numeric(
                        0.0,
                        format!("watching {} from byte {len}", self.path.display()),
                    ));
                }
                // Rotated or truncated.
                Some(previous) if previous > len => 0,
                Some(previous) => previous,
            }
        };
        file.seek(SeekFrom::Start(start)).await?;
        let mut appended = Vec::new();
        file.read_to_end(&mut appended).await?;
        *self.offset.lock() = Some(start + appended.len() as u64);

        let text = String::from_utf8_lossy(&appended);
        let hits: Vec<&str> = text
            .lines()
            .filter(|line| self.pattern.is_match(line))
            .collect();
        let tail = hits
            .iter()
            .rev()
            .take(EVIDENCE_LINES)
            .rev()
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        Ok(HealthReading::numeric(hits.len() as f64, tail))
    }
}

/// Up when the command exits with status zero.
pub struct CommandSignal {
    spec: SignalSpec,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSignal {
    pub fn new(
        spec: SignalSpec,
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            spec,
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl HealthSignal for CommandSignal {
    fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    async fn read(&self) -> Result<HealthReading> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = command.spawn()?;
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(MeshError::Timeout(self.timeout)),
        };
        let mut evidence = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if evidence.is_empty() {
            evidence = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        Ok(HealthReading::flag(
            output.status.success(),
            format!("{} exited with {}: {}", self.program, output.status, clip(&evidence)),
        ))
    }
}

fn clip(text: &str) -> String {
    if text.len() <= EVIDENCE_BYTES {
        return text.to_string();
    }
    let mut cut = text.len() - EVIDENCE_BYTES;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &text[cut..])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderConfig {
    HttpLiveness {
        url: String,
    },
    HttpLatency {
        url: String,
    },
    LogPattern {
        path: PathBuf,
        pattern: String,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// One entry of the operator's signal list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalConfig {
    #[serde(flatten)]
    pub spec: SignalSpec,
    #[serde(flatten)]
    pub provider: ProviderConfig,
}

impl SignalConfig {
    pub fn build(
        self,
        http: &reqwest::Client,
        probe_timeout: Duration,
    ) -> Result<Arc<dyn HealthSignal>> {
        let signal: Arc<dyn HealthSignal> = match self.provider {
            ProviderConfig::HttpLiveness { url } => {
                Arc::new(HttpLivenessSignal::new(self.spec, url, http.clone()))
            }
            ProviderConfig::HttpLatency { url } => {
                Arc::new(HttpLatencySignal::new(self.spec, url, http.clone()))
            }
            ProviderConfig::LogPattern { path, pattern } => {
                Arc::new(LogPatternSignal::new(self.spec, path, &pattern)?)
            }
            ProviderConfig::Command { program, args } => {
                Arc::new(CommandSignal::new(self.spec, program, args, probe_timeout))
            }
        };
        Ok(signal)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub agent_id: String,
    pub queue: String,
    pub dispatch_queue: String,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub probe_retries: u32,
    pub window_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            agent_id: "monitoring".to_string(),
            queue: "monitoring".to_string(),
            dispatch_queue: DISPATCHER_INBOX.to_string(),
            interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            probe_retries: 1,
            window_size: 20,
        }
    }
}

impl MonitorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_probe_retries(mut self, retries: u32) -> Self {
        self.probe_retries = retries;
        self
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size.max(1);
        self
    }

    pub fn with_dispatch_queue(mut self, queue: impl Into<String>) -> Self {
        self.dispatch_queue = queue.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalSample {
    pub signal: String,
    pub signature: IncidentSignature,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Reading>,
    pub breached: bool,
    pub evidence: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub taken_at: DateTime<Utc>,
    pub samples: Vec<SignalSample>,
}

impl HealthSnapshot {
    pub fn healthy(&self) -> bool {
        self.samples.iter().all(|sample| !sample.breached)
    }
}

/// Last N breach flags of one signal.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<bool>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, breached: bool) {
        self.samples.push_back(breached);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn consecutive_breaches(&self) -> u32 {
        self.samples.iter().rev().take_while(|breached| **breached).count() as u32
    }

    pub fn breach_ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let breached = self.samples.iter().filter(|breached| **breached).count();
        breached as f64 / self.samples.len() as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub opened: Vec<Incident>,
    pub recovered: Vec<IncidentSignature>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenIncident {
    pub incident: Incident,
    pub escalated: bool,
    pub recovery_noticed: bool,
}

#[derive(Default)]
struct MonitorState {
    windows: HashMap<String, RollingWindow>,
    open: HashMap<IncidentSignature, OpenIncident>,
}

/// Probes the configured signals and raises incidents. Also an agent: it
/// consumes `incident_update` tasks to learn when an incident has ended.
pub struct Monitor {
    config: MonitorConfig,
    signals: Vec<Arc<dyn HealthSignal>>,
    state: Mutex<MonitorState>,
    fabric: Arc<QueueFabric>,
    channel: Arc<dyn OperatorChannel>,
    status: Option<Arc<dyn StatusSink>>,
    observer: Arc<dyn MeshObserver>,
    dead_letters: Mutex<Option<broadcast::Receiver<Task>>>,
}

impl Monitor {
    /// Incidents whose tasks are still pending on `fabric` are taken as
    /// open, so a restart does not raise them a second time.
    pub fn new(
        config: MonitorConfig,
        signals: Vec<Arc<dyn HealthSignal>>,
        fabric: Arc<QueueFabric>,
        channel: Arc<dyn OperatorChannel>,
    ) -> Self {
        let dead_letters = fabric.subscribe_dead_letters();
        let monitor = Self {
            config,
            signals,
            state: Mutex::new(MonitorState::default()),
            fabric,
            channel,
            status: None,
            observer: Arc::new(NoopObserver),
            dead_letters: Mutex::new(Some(dead_letters)),
        };
        let restored = monitor.restore_open_incidents();
        if restored > 0 {
            info!(restored, "open incidents restored from pending tasks");
        }
        monitor
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = Some(sink);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Reads every signal concurrently. A signal that cannot be read within
    /// the probe timeout and retries counts as a breached sample.
    pub async fn probe(&self) -> HealthSnapshot {
        let mut reads = JoinSet::new();
        for signal in &self.signals {
            let signal = signal.clone();
            let probe_timeout = self.config.probe_timeout;
            let retries = self.config.probe_retries;
            reads.spawn(async move { sample(signal, probe_timeout, retries).await });
        }
        let mut samples = Vec::with_capacity(self.signals.len());
        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok(sample) => samples.push(sample),
                Err(err) => warn!("health probe task failed: {err}"),
            }
        }
        samples.sort_by(|a, b| a.signal.cmp(&b.signal));
        HealthSnapshot {
            taken_at: Utc::now(),
            samples,
        }
    }

    /// Feeds a snapshot into the rolling windows. Opens an incident when a
    /// signal has breached for its configured number of consecutive samples
    /// and its signature has no open incident yet.
    pub fn evaluate(&self, snapshot: &HealthSnapshot) -> Evaluation {
        let mut evaluation = Evaluation::default();
        let mut state = self.state.lock();
        for sample in &snapshot.samples {
            let Some(spec) = self.spec(&sample.signal) else {
                continue;
            };
            let window_size = self.config.window_size;
            let window = state
                .windows
                .entry(sample.signal.clone())
                .or_insert_with(|| RollingWindow::new(window_size));
            window.push(sample.breached);
            let consecutive = window.consecutive_breaches();

            if sample.breached {
                if consecutive >= spec.consecutive && !state.open.contains_key(&sample.signature) {
                    let incident = Incident::new(
                        spec.name.clone(),
                        spec.signal_type,
                        spec.component.clone(),
                        spec.severity,
                        sample.evidence.clone(),
                    );
                    state.open.insert(
                        sample.signature.clone(),
                        OpenIncident {
                            incident: incident.clone(),
                            escalated: false,
                            recovery_noticed: false,
                        },
                    );
                    evaluation.opened.push(incident);
                }
            } else if let Some(open) = state.open.get_mut(&sample.signature) {
                if !open.recovery_noticed {
                    open.recovery_noticed = true;
                    evaluation.recovered.push(sample.signature.clone());
                }
            }
        }
        evaluation
    }

    /// One probe-evaluate-emit round.
    #[instrument(skip(self), fields(agent = %self.config.agent_id))]
    pub async fn tick(&self) -> Evaluation {
        let snapshot = self.probe().await;
        let mut evaluation = self.evaluate(&snapshot);
        let mut emitted = Vec::with_capacity(evaluation.opened.len());
        for incident in evaluation.opened.drain(..) {
            match self.emit(&incident) {
                Ok(()) => {
                    self.observer.incident_opened(&incident.signature());
                    emitted.push(incident);
                }
                Err(err) => {
                    // Forget it so the next round can raise it again.
                    warn!(
                        signature = %incident.signature(),
                        "failed to publish incident: {err}"
                    );
                    self.state.lock().open.remove(&incident.signature());
                }
            }
        }
        evaluation.opened = emitted;
        for signature in &evaluation.recovered {
            notify_or_log(
                self.channel.as_ref(),
                OperatorNotice::new(
                    NoticeKind::Recovery,
                    format!("{signature} recovered"),
                    "signal is healthy again; the incident stays open until repair \
                     or an operator closes it",
                ),
            )
            .await;
        }
        evaluation
    }

    /// Samples the signals on the configured interval and escalates incidents whose
    /// tasks reach the dead-letter queue, until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dead_letters = self
            .dead_letters
            .lock()
            .take()
            .unwrap_or_else(|| self.fabric.subscribe_dead_letters());
        info!(
            signals = self.signals.len(),
            interval = ?self.config.interval,
            "monitoring loop started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evaluation = self.tick().await;
                    debug!(
                        opened = evaluation.opened.len(),
                        recovered = evaluation.recovered.len(),
                        "monitoring round finished"
                    );
                }
                received = dead_letters.recv() => match received {
                    Ok(task) => {
                        self.escalate_dead_letter(&task).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        error!(
                            skipped,
                            "dead-letter feed overflowed; some incidents were not escalated"
                        );
                    }
                    Err(RecvError::Closed) => {
                        dead_letters = self.fabric.subscribe_dead_letters();
                    }
                },
            }
        }
        info!("monitoring loop stopped");
    }

    /// Rebuilds the open set from incident tasks still pending on the
    /// fabric. A re-raised incident carries the same id, so the copy with
    /// the most repair attempts wins.
    pub fn restore_open_incidents(&self) -> usize {
        let mut restored: HashMap<IncidentSignature, Incident> = HashMap::new();
        for task in self.fabric.pending(&TaskKind::Incident) {
            let incident = match Incident::from_task(&task) {
                Ok(incident) => incident,
                Err(err) => {
                    warn!(task_id = %task.id, "skipping unreadable incident task: {err}");
                    continue;
                }
            };
            match restored.get(&incident.signature()) {
                Some(kept)
                    if kept.id == incident.id
                        && kept.repair_attempts >= incident.repair_attempts => {}
                Some(kept) if kept.id != incident.id && kept.opened_at <= incident.opened_at => {
                    warn!(
                        signature = %incident.signature(),
                        kept = %kept.id,
                        ignored = %incident.id,
                        "two pending incidents share a signature"
                    );
                }
                _ => {
                    restored.insert(incident.signature(), incident);
                }
            }
        }
        let mut state = self.state.lock();
        let mut count = 0;
        for (signature, incident) in restored {
            if state.open.contains_key(&signature) {
                continue;
            }
            state.open.insert(
                signature,
                OpenIncident {
                    incident,
                    escalated: false,
                    recovery_noticed: false,
                },
            );
            count += 1;
        }
        count
    }

    /// Escalates the open incident behind a dead-lettered incident task:
    /// the operator is told and an `Escalated` update is routed like any
    /// other. Returns false for other tasks and for incidents that are no
    /// longer open or were already escalated.
    pub async fn escalate_dead_letter(&self, task: &Task) -> bool {
        if task.kind != TaskKind::Incident {
            return false;
        }
        let incident = match Incident::from_task(task) {
            Ok(incident) => incident,
            Err(err) => {
                warn!(task_id = %task.id, "dead-lettered incident task is unreadable: {err}");
                return false;
            }
        };
        let reason = task.status_reason.as_deref().unwrap_or("dead-lettered");
        let update = IncidentUpdate {
            incident_id: incident.id,
            signature: incident.signature(),
            resolution: Resolution::Escalated,
            summary: format!("automatic repair stopped: incident task dead-lettered ({reason})"),
        };
        if !self.apply_update(&update) {
            return false;
        }
        notify_or_log(
            self.channel.as_ref(),
            OperatorNotice::new(
                NoticeKind::Escalation,
                format!("{} needs an operator", incident.signature()),
                format!(
                    "automatic repair stopped after {} attempt(s): the incident task \
                     was dead-lettered ({reason}). evidence: {}",
                    task.attempts, incident.evidence
                ),
            )
            .for_incident(incident.id),
        )
        .await;
        match update.to_task(&self.config.agent_id) {
            Ok(update_task) => {
                self.report(&update_task);
                if let Err(err) = self.fabric.publish(&self.config.dispatch_queue, update_task) {
                    warn!(incident_id = %incident.id, "failed to route escalation update: {err}");
                }
            }
            Err(err) => warn!(
                incident_id = %incident.id,
                "failed to build escalation update: {err}"
            ),
        }
        true
    }

    pub fn open_incidents(&self) -> Vec<OpenIncident> {
        let mut open: Vec<OpenIncident> = self.state.lock().open.values().cloned().collect();
        open.sort_by(|a, b| a.incident.opened_at.cmp(&b.incident.opened_at));
        open
    }

    /// Applies an outcome reported for an incident. Returns false when the
    /// incident is no longer open, which makes repeated updates harmless.
    pub fn apply_update(&self, update: &IncidentUpdate) -> bool {
        let mut state = self.state.lock();
        let matches = state
            .open
            .get(&update.signature)
            .map(|open| open.incident.id == update.incident_id)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        match update.resolution {
            Resolution::Closed => {
                state.open.remove(&update.signature);
                info!(signature = %update.signature, "incident closed");
            }
            Resolution::Escalated => {
                let Some(open) = state.open.get_mut(&update.signature) else {
                    return false;
                };
                if open.escalated {
                    return false;
                }
                open.escalated = true;
                warn!(signature = %update.signature, "incident escalated to operator");
            }
        }
        true
    }

    /// Operator override: closes an incident whatever its state.
    pub fn resolve(&self, incident_id: uuid::Uuid) -> Option<Incident> {
        let mut state = self.state.lock();
        let signature = state
            .open
            .iter()
            .find(|(_, open)| open.incident.id == incident_id)
            .map(|(signature, _)| signature.clone())?;
        let removed = state.open.remove(&signature).map(|open| open.incident);
        info!(%signature, "incident resolved by operator");
        removed
    }

    fn spec(&self, name: &str) -> Option<&SignalSpec> {
        self.signals
            .iter()
            .map(|signal| signal.spec())
            .find(|spec| spec.name == name)
    }

    fn report(&self, task: &Task) {
        if let Some(sink) = &self.status {
            if let Err(err) = sink.report_status(StatusUpdate::for_task(task)) {
                debug!(task_id = %task.id, "status board rejected task: {err}");
            }
        }
    }

    fn emit(&self, incident: &Incident) -> Result<()> {
        let task = incident.to_task(&self.config.agent_id)?;
        self.report(&task);
        self.fabric.publish(&self.config.dispatch_queue, task)?;
        info!(
            incident_id = %incident.id,
            signature = %incident.signature(),
            severity = ?incident.severity,
            "incident opened"
        );
        Ok(())
    }
}

async fn sample(
    signal: Arc<dyn HealthSignal>,
    probe_timeout: Duration,
    retries: u32,
) -> SignalSample {
    let spec = signal.spec();
    let mut attempt = 0u32;
    loop {
        let failure = match timeout(probe_timeout, signal.read()).await {
            Ok(Ok(reading)) => {
                return SignalSample {
                    signal: spec.name.clone(),
                    signature: spec.signature(),
                    value: Some(reading.value),
                    breached: spec.threshold.breached(reading.value),
                    evidence: reading.evidence,
                };
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("no reading within {probe_timeout:?}"),
        };
        if attempt >= retries {
            return SignalSample {
                signal: spec.name.clone(),
                signature: spec.signature(),
                value: None,
                breached: true,
                evidence: format!("probe failed: {failure}"),
            };
        }
        attempt += 1;
        debug!(signal = %spec.name, attempt, "probe failed, retrying: {failure}");
        sleep(Duration::from_millis(50)).await;
    }
}

#[async_trait]
impl Verifier for Monitor {
    async fn verify(&self, incident: &Incident) -> Result<VerificationResult> {
        let signal = self
            .signals
            .iter()
            .find(|signal| signal.spec().name == incident.signal)
            .or_else(|| {
                self.signals
                    .iter()
                    .find(|signal| signal.spec().signature() == incident.signature())
            })
            .cloned()
            .ok_or_else(|| {
                MeshError::InvalidOperation(format!(
                    "no health signal can verify '{}'",
                    incident.signature()
                ))
            })?;
        let sample = sample(signal, self.config.probe_timeout, self.config.probe_retries).await;
        Ok(VerificationResult {
            passed: !sample.breached,
            evidence: sample.evidence,
            checked_at: Utc::now(),
        })
    }
}

#[async_trait]
impl AgentHandler for Monitor {
    fn registration(&self) -> AgentRegistration {
        AgentRegistration::new(self.config.agent_id.clone(), self.config.queue.clone())
            .with_kinds([TaskKind::IncidentUpdate.as_str(), TaskKind::HealthProbe.as_str()])
            .with_description("Probes service health and raises incidents")
    }

    async fn handle(&self, task: Task, cancellation: CancellationToken) -> Result<HandlerOutcome> {
        if cancellation.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        match task.kind {
            TaskKind::IncidentUpdate => {
                let update = IncidentUpdate::from_task(&task)?;
                let applied = self.apply_update(&update);
                Ok(HandlerOutcome::done().with_result(json!({
                    "incident_id": update.incident_id,
                    "resolution": update.resolution,
                    "applied": applied,
                })))
            }
            TaskKind::HealthProbe => {
                let evaluation = self.tick().await;
                let opened: Vec<_> = evaluation.opened.iter().map(|incident| incident.id).collect();
                let recovered: Vec<_> =
                    evaluation.recovered.iter().map(|sig| sig.to_string()).collect();
                Ok(HandlerOutcome::done().with_result(json!({
                    "opened": opened,
                    "recovered": recovered,
                })))
            }
            other => Err(MeshError::InvalidOperation(format!(
                "monitoring does not handle '{other}' tasks"
            ))),
        }
    }
}
