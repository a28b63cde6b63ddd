use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::errors::{MeshError, Result};
use crate::journal::{Journal, JournalRecord, MemoryJournal};
use crate::status::{StatusSink, StatusUpdate};
use crate::task::{reasons, Task, TaskKind};
use crate::telemetry::{MeshObserver, NoopObserver};

pub const DEAD_LETTER_QUEUE: &str = "dead_letter";
const DEAD_LETTER_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub dead_letter_queue: String,
    /// Oldest dead letters are evicted past this many.
    pub dead_letter_capacity: usize,
    /// First hold-back of a nacked delivery; doubles per attempt.
    pub redelivery_delay: Duration,
    pub max_redelivery_delay: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 5,
            poll_interval: Duration::from_millis(50),
            dead_letter_queue: DEAD_LETTER_QUEUE.to_string(),
            dead_letter_capacity: 1000,
            redelivery_delay: Duration::from_secs(2),
            max_redelivery_delay: Duration::from_secs(300),
        }
    }
}

impl FabricConfig {
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity.max(1);
        self
    }

    /// `Duration::ZERO` makes nacked deliveries ready again at once.
    pub fn with_redelivery_delay(mut self, base: Duration, max: Duration) -> Self {
        self.redelivery_delay = base;
        self.max_redelivery_delay = max.max(base);
        self
    }

    fn redelivery_hold(&self, attempts: u32) -> Duration {
        Backoff::new(self.redelivery_delay, self.max_redelivery_delay)
            .at_attempt(attempts.saturating_sub(1))
            .next_delay()
    }
}

/// Handle for one delivery of a message. Valid until acknowledged, nacked, or
/// the visibility timeout reclaims the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckToken(String);

impl AckToken {
    fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AckToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for AckToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Publisher confirmation: the message is durable once this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishAck {
    pub message_id: Uuid,
    pub queue: String,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub message_id: Uuid,
    pub token: AckToken,
    pub task: Task,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
struct Message {
    id: Uuid,
    task: Task,
    not_before: Option<Instant>,
}

impl Message {
    fn new(id: Uuid, task: Task) -> Self {
        Self {
            id,
            task,
            not_before: None,
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

struct Replayed {
    queue: String,
    seq: u64,
    task: Task,
    delivered: bool,
}

struct InFlight {
    queue: String,
    message: Message,
    deadline: Instant,
}

#[derive(Default)]
struct FabricState {
    queues: HashMap<String, BTreeMap<(Reverse<i32>, u64), Message>>,
    in_flight: HashMap<AckToken, InFlight>,
    next_seq: u64,
}

/// Named durable queues with at-least-once delivery.
///
/// Within a queue, higher task priority is served first and equal priorities
/// are FIFO. Nothing is ordered across queues.
pub struct QueueFabric {
    config: FabricConfig,
    state: Mutex<FabricState>,
    journal: Arc<dyn Journal>,
    notify: Notify,
    dead_letters: broadcast::Sender<Task>,
    status: Option<Arc<dyn StatusSink>>,
    observer: Arc<dyn MeshObserver>,
}

impl QueueFabric {
    pub fn new(config: FabricConfig) -> Self {
        let mut state = FabricState::default();
        state
            .queues
            .insert(config.dead_letter_queue.clone(), BTreeMap::new());
        let (dead_letters, _) = broadcast::channel(DEAD_LETTER_FEED_CAPACITY);
        Self {
            config,
            state: Mutex::new(state),
            journal: Arc::new(MemoryJournal::new()),
            notify: Notify::new(),
            dead_letters,
            status: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Opens a fabric backed by `journal`, replaying whatever it holds.
    /// Messages that were in flight when the process stopped become ready
    /// again with one more attempt counted; those past the attempt cap go
    /// straight to the dead-letter queue.
    pub fn open(config: FabricConfig, journal: Arc<dyn Journal>) -> Result<Self> {
        let records = journal.load()?;
        let mut declared: Vec<String> = Vec::new();
        let mut live: HashMap<Uuid, Replayed> = HashMap::new();
        for record in records {
            match record {
                JournalRecord::Declared { queue } => {
                    if !declared.contains(&queue) {
                        declared.push(queue);
                    }
                }
                JournalRecord::Enqueued {
                    message_id,
                    queue,
                    seq,
                    task,
                } => {
                    live.insert(
                        message_id,
                        Replayed {
                            queue,
                            seq,
                            task,
                            delivered: false,
                        },
                    );
                }
                JournalRecord::Delivered { message_id } => {
                    if let Some(entry) = live.get_mut(&message_id) {
                        entry.delivered = true;
                    }
                }
                JournalRecord::Removed { message_id } => {
                    live.remove(&message_id);
                }
            }
        }

        let mut state = FabricState::default();
        state
            .queues
            .insert(config.dead_letter_queue.clone(), BTreeMap::new());
        for queue in &declared {
            state.queues.entry(queue.clone()).or_default();
        }
        let mut restored = 0usize;
        let mut buried = 0usize;
        for (message_id, mut entry) in live {
            state.next_seq = state.next_seq.max(entry.seq + 1);
            if entry.delivered && entry.queue != config.dead_letter_queue {
                entry.task.attempts = entry.task.attempts.saturating_add(1);
                if entry.task.attempts >= config.max_attempts {
                    mark_dead(&mut entry.task, reasons::MAX_ATTEMPTS_EXCEEDED);
                    warn!(
                        task_id = %entry.task.id,
                        queue = %entry.queue,
                        attempts = entry.task.attempts,
                        "task was in flight at every restart, dead-lettering"
                    );
                    entry.queue = config.dead_letter_queue.clone();
                    buried += 1;
                }
            }
            let key = (Reverse(entry.task.priority), entry.seq);
            state
                .queues
                .entry(entry.queue)
                .or_default()
                .insert(key, Message::new(message_id, entry.task));
            restored += 1;
        }
        evict_dead_letters(&mut state, &config);

        let snapshot = live_records(&state);
        journal.compact(&snapshot)?;
        info!(
            queues = state.queues.len(),
            restored, buried, "queue fabric restored from journal"
        );

        let (dead_letters, _) = broadcast::channel(DEAD_LETTER_FEED_CAPACITY);
        Ok(Self {
            config,
            state: Mutex::new(state),
            journal,
            notify: Notify::new(),
            dead_letters,
            status: None,
            observer: Arc::new(NoopObserver),
        })
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = Some(sink);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.config.dead_letter_queue
    }

    /// Every task parked on the dead-letter queue from now on.
    pub fn subscribe_dead_letters(&self) -> broadcast::Receiver<Task> {
        self.dead_letters.subscribe()
    }

    pub fn declare(&self, queue: &str) -> Result<()> {
        let queue = queue.trim();
        if queue.is_empty() {
            return Err(MeshError::InvalidOperation(
                "queue name must not be empty".to_string(),
            ));
        }
        let mut state = self.state.lock();
        if state.queues.contains_key(queue) {
            return Ok(());
        }
        self.journal.append(&JournalRecord::Declared {
            queue: queue.to_string(),
        })?;
        state.queues.insert(queue.to_string(), BTreeMap::new());
        debug!(queue, "queue declared");
        Ok(())
    }

    pub fn exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Persists `task` on `queue`. The journal write completes before this
    /// returns; a failed write surfaces as a transport error and leaves the
    /// queue unchanged.
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind))]
    pub fn publish(&self, queue: &str, task: Task) -> Result<PublishAck> {
        let message_id = Uuid::new_v4();
        {
            let mut state = self.state.lock();
            if !state.queues.contains_key(queue) {
                return Err(MeshError::QueueNotFound(queue.to_string()));
            }
            let seq = state.next_seq;
            self.journal
                .append(&JournalRecord::Enqueued {
                    message_id,
                    queue: queue.to_string(),
                    seq,
                    task: task.clone(),
                })
                .map_err(|err| MeshError::Transport(format!("journal write failed: {err}")))?;
            state.next_seq += 1;
            let key = (Reverse(task.priority), seq);
            if let Some(ready) = state.queues.get_mut(queue) {
                ready.insert(key, Message::new(message_id, task));
            }
        }
        self.notify.notify_waiters();
        Ok(PublishAck {
            message_id,
            queue: queue.to_string(),
        })
    }

    /// Waits up to `wait` for a message. An empty queue yields `Ok(None)`.
    pub async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_consume(queue)? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(self.config.poll_interval);
            let _ = timeout(nap, notified).await;
        }
    }

    /// Non-blocking variant of [`QueueFabric::consume`]. Messages held back
    /// after a nack are skipped until their delay has passed.
    pub fn try_consume(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.reclaim_expired(&mut state, now);
        let ready = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MeshError::QueueNotFound(queue.to_string()))?;
        let next = ready
            .iter()
            .find(|(_, message)| message.is_ready(now))
            .map(|(key, _)| *key);
        let Some(message) = next.and_then(|key| ready.remove(&key)) else {
            return Ok(None);
        };
        if let Err(err) = self.journal.append(&JournalRecord::Delivered {
            message_id: message.id,
        }) {
            // A crash now replays the message without counting this attempt.
            warn!(queue, "failed to journal delivery: {err}");
        }
        let token = AckToken::fresh();
        let delivery = Delivery {
            queue: queue.to_string(),
            message_id: message.id,
            token: token.clone(),
            task: message.task.clone(),
        };
        state.in_flight.insert(
            token,
            InFlight {
                queue: queue.to_string(),
                message,
                deadline: Instant::now() + self.config.visibility_timeout,
            },
        );
        Ok(Some(delivery))
    }

    pub fn acknowledge(&self, token: &AckToken) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .in_flight
            .remove(token)
            .ok_or_else(|| MeshError::UnknownAckToken(token.to_string()))?;
        if let Err(err) = self.journal.append(&JournalRecord::Removed {
            message_id: entry.message.id,
        }) {
            // Not removed durably: a restart will deliver it once more.
            warn!(queue = %entry.queue, "failed to journal acknowledgement: {err}");
        }
        Ok(())
    }

    /// Gives a delivery back. `requeue = true` counts as a redelivery and
    /// holds the message back for a delay that grows with its attempts;
    /// `requeue = false` dead-letters the task as rejected.
    pub fn nack(&self, token: &AckToken, requeue: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            let entry = state
                .in_flight
                .remove(token)
                .ok_or_else(|| MeshError::UnknownAckToken(token.to_string()))?;
            if requeue {
                self.redeliver(&mut state, entry.queue, entry.message, true);
            } else {
                self.bury(&mut state, entry.message, reasons::REJECTED);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Marks `task` dead-lettered with `reason` and parks it on the
    /// dead-letter queue.
    pub fn dead_letter(&self, task: Task, reason: &str) -> Result<Task> {
        let message = Message::new(Uuid::new_v4(), task);
        let mut state = self.state.lock();
        Ok(self.bury(&mut state, message, reason))
    }

    /// Removes up to `limit` dead letters, oldest first, once an operator
    /// has dealt with them.
    pub fn drain_dead_letters(&self, limit: usize) -> Result<Vec<Task>> {
        let mut state = self.state.lock();
        let parked = state
            .queues
            .get_mut(&self.config.dead_letter_queue)
            .ok_or_else(|| MeshError::QueueNotFound(self.config.dead_letter_queue.clone()))?;
        let mut keys: Vec<(Reverse<i32>, u64)> = parked.keys().copied().collect();
        keys.sort_by_key(|(_, seq)| *seq);
        let mut drained = Vec::new();
        for key in keys.into_iter().take(limit) {
            let Some(message) = parked.remove(&key) else {
                continue;
            };
            self.journal.append(&JournalRecord::Removed {
                message_id: message.id,
            })?;
            drained.push(message.task);
        }
        if !drained.is_empty() {
            info!(drained = drained.len(), "dead letters drained");
        }
        Ok(drained)
    }

    pub fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let state = self.state.lock();
        let ready = state
            .queues
            .get(queue)
            .ok_or_else(|| MeshError::QueueNotFound(queue.to_string()))?
            .len();
        let in_flight = state
            .in_flight
            .values()
            .filter(|entry| entry.queue == queue)
            .count();
        Ok(QueueDepth { ready, in_flight })
    }

    /// Ready tasks in delivery order, without consuming them.
    pub fn peek(&self, queue: &str, limit: usize) -> Result<Vec<Task>> {
        let state = self.state.lock();
        let ready = state
            .queues
            .get(queue)
            .ok_or_else(|| MeshError::QueueNotFound(queue.to_string()))?;
        Ok(ready
            .values()
            .take(limit)
            .map(|message| message.task.clone())
            .collect())
    }

    /// Every live task of `kind` outside the dead-letter queue, ready or
    /// in flight, in no particular order.
    pub fn pending(&self, kind: &TaskKind) -> Vec<Task> {
        let state = self.state.lock();
        let ready = state
            .queues
            .iter()
            .filter(|(queue, _)| **queue != self.config.dead_letter_queue)
            .flat_map(|(_, messages)| messages.values());
        let in_flight = state
            .in_flight
            .values()
            .filter(|entry| entry.queue != self.config.dead_letter_queue)
            .map(|entry| &entry.message);
        ready
            .chain(in_flight)
            .filter(|message| &message.task.kind == kind)
            .map(|message| message.task.clone())
            .collect()
    }

    /// Rewrites the journal so it only holds live messages.
    pub fn compact(&self) -> Result<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut records = live_records(state);
        for entry in state.in_flight.values() {
            records.push(JournalRecord::Enqueued {
                message_id: entry.message.id,
                queue: entry.queue.clone(),
                seq: state.next_seq,
                task: entry.message.task.clone(),
            });
            records.push(JournalRecord::Delivered {
                message_id: entry.message.id,
            });
            state.next_seq += 1;
        }
        self.journal.compact(&records)?;
        Ok(records.len())
    }

    fn reclaim_expired(&self, state: &mut FabricState, now: Instant) {
        let expired: Vec<AckToken> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(entry) = state.in_flight.remove(&token) {
                debug!(
                    queue = %entry.queue,
                    task_id = %entry.message.task.id,
                    "visibility timeout elapsed, reclaiming message"
                );
                self.redeliver(state, entry.queue, entry.message, false);
            }
        }
    }

    fn redeliver(
        &self,
        state: &mut FabricState,
        queue: String,
        mut message: Message,
        hold: bool,
    ) {
        message.task.attempts = message.task.attempts.saturating_add(1);
        if message.task.attempts >= self.config.max_attempts {
            self.bury(state, message, reasons::MAX_ATTEMPTS_EXCEEDED);
            return;
        }
        message.not_before = None;
        if hold {
            let delay = self.config.redelivery_hold(message.task.attempts);
            if !delay.is_zero() {
                debug!(task_id = %message.task.id, ?delay, "holding back redelivery");
                message.not_before = Some(Instant::now() + delay);
            }
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        if let Err(err) = self.journal.append(&JournalRecord::Enqueued {
            message_id: message.id,
            queue: queue.clone(),
            seq,
            task: message.task.clone(),
        }) {
            warn!(queue = %queue, "failed to journal redelivery: {err}");
        }
        let key = (Reverse(message.task.priority), seq);
        state.queues.entry(queue).or_default().insert(key, message);
    }

    fn bury(&self, state: &mut FabricState, mut message: Message, reason: &str) -> Task {
        mark_dead(&mut message.task, reason);
        message.not_before = None;
        let queue = self.config.dead_letter_queue.clone();
        let seq = state.next_seq;
        state.next_seq += 1;
        if let Err(err) = self.journal.append(&JournalRecord::Enqueued {
            message_id: message.id,
            queue: queue.clone(),
            seq,
            task: message.task.clone(),
        }) {
            warn!(queue = %queue, "failed to journal dead letter: {err}");
        }
        warn!(
            task_id = %message.task.id,
            kind = %message.task.kind,
            attempts = message.task.attempts,
            reason,
            "task dead-lettered"
        );
        self.observer.task_dead_lettered(reason);
        if let Some(sink) = &self.status {
            if let Err(err) = sink.report_status(StatusUpdate::for_task(&message.task)) {
                debug!(task_id = %message.task.id, "status board kept its state: {err}");
            }
        }
        let task = message.task.clone();
        state
            .queues
            .entry(queue)
            .or_default()
            .insert((Reverse(message.task.priority), seq), message);
        for evicted in evict_dead_letters(state, &self.config) {
            if let Err(err) = self.journal.append(&JournalRecord::Removed {
                message_id: evicted.id,
            }) {
                warn!("failed to journal dead-letter eviction: {err}");
            }
        }
        // Nobody listening is fine; the task is parked either way.
        let _ = self.dead_letters.send(task.clone());
        task
    }
}

fn mark_dead(task: &mut Task, reason: &str) {
    if let Err(err) = task.dead_letter(reason) {
        warn!(task_id = %task.id, "dead-lettering a finished task: {err}");
        task.status_reason = Some(reason.to_string());
    }
}

/// Drops the oldest dead letters beyond the configured capacity.
fn evict_dead_letters(state: &mut FabricState, config: &FabricConfig) -> Vec<Message> {
    let Some(parked) = state.queues.get_mut(&config.dead_letter_queue) else {
        return Vec::new();
    };
    let excess = parked.len().saturating_sub(config.dead_letter_capacity);
    if excess == 0 {
        return Vec::new();
    }
    let mut keys: Vec<(Reverse<i32>, u64)> = parked.keys().copied().collect();
    keys.sort_by_key(|(_, seq)| *seq);
    let evicted: Vec<Message> = keys
        .into_iter()
        .take(excess)
        .filter_map(|key| parked.remove(&key))
        .collect();
    warn!(
        evicted = evicted.len(),
        capacity = config.dead_letter_capacity,
        "dead-letter queue full, evicting oldest"
    );
    evicted
}

fn live_records(state: &FabricState) -> Vec<JournalRecord> {
    let mut records: Vec<JournalRecord> = state
        .queues
        .keys()
        .map(|queue| JournalRecord::Declared {
            queue: queue.clone(),
        })
        .collect();
    for (queue, ready) in &state.queues {
        for ((_, seq), message) in ready {
            records.push(JournalRecord::Enqueued {
                message_id: message.id,
                queue: queue.clone(),
                seq: *seq,
                task: message.task.clone(),
            });
        }
    }
    records
}
