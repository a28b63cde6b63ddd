use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::errors::{MeshError, Result};
use crate::task::{Task, TaskStatus};

const DEFAULT_CAPACITY: usize = 4096;
const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub kind: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub agent: Option<String>,
    pub reason: Option<String>,
    pub result: Option<Value>,
    pub attempts: Option<u32>,
}

impl StatusUpdate {
    pub fn new(task_id: Uuid, status: TaskStatus) -> Self {
        Self {
            task_id,
            status,
            agent: None,
            reason: None,
            result: None,
            attempts: None,
        }
    }

    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            agent: task.assigned_to.clone(),
            reason: task.status_reason.clone(),
            result: None,
            attempts: Some(task.attempts),
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Where agents and the fabric report task progress.
pub trait StatusSink: Send + Sync {
    fn report_status(&self, update: StatusUpdate) -> Result<()>;

    fn current(&self, task_id: &Uuid) -> Option<TaskStatus>;
}

/// In-memory view of the latest status of every task the core has seen.
pub struct StatusBoard {
    capacity: usize,
    inner: Mutex<BoardState>,
    changes: broadcast::Sender<TaskRecord>,
}

#[derive(Default)]
struct BoardState {
    records: HashMap<Uuid, TaskRecord>,
    order: VecDeque<Uuid>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl StatusBoard {
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(BoardState::default()),
            changes,
        }
    }

    /// Every accepted change, for mirrors such as a persistent task log.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskRecord> {
        self.changes.subscribe()
    }

    /// Records a freshly submitted task.
    pub fn track(&self, task: &Task) -> Result<TaskRecord> {
        let record = {
            let mut guard = self.inner.lock();
            if let Some(existing) = guard.records.get(&task.id) {
                return Ok(existing.clone());
            }
            let now = Utc::now();
            let record = TaskRecord {
                task_id: task.id,
                kind: task.kind.to_string(),
                status: task.status,
                assigned_to: task.assigned_to.clone(),
                reason: task.status_reason.clone(),
                result: None,
                attempts: task.attempts,
                created_at: task.created_at,
                updated_at: now,
            };
            guard.records.insert(task.id, record.clone());
            guard.order.push_back(task.id);
            self.evict(&mut guard);
            record
        };
        let _ = self.changes.send(record.clone());
        Ok(record)
    }

    pub fn apply(&self, update: StatusUpdate) -> Result<TaskRecord> {
        let record = {
            let mut guard = self.inner.lock();
            let now = Utc::now();
            let record = match guard.records.get_mut(&update.task_id) {
                Some(existing) => {
                    if !existing.status.can_transition_to(update.status) {
                        return Err(MeshError::InvalidTransition {
                            from: existing.status,
                            to: update.status,
                        });
                    }
                    existing.status = update.status;
                    if update.agent.is_some() {
                        existing.assigned_to = update.agent;
                    }
                    if update.reason.is_some() {
                        existing.reason = update.reason;
                    }
                    if update.result.is_some() {
                        existing.result = update.result;
                    }
                    if let Some(attempts) = update.attempts {
                        existing.attempts = existing.attempts.max(attempts);
                    }
                    existing.updated_at = now;
                    existing.clone()
                }
                None => {
                    let record = TaskRecord {
                        task_id: update.task_id,
                        kind: String::new(),
                        status: update.status,
                        assigned_to: update.agent,
                        reason: update.reason,
                        result: update.result,
                        attempts: update.attempts.unwrap_or(0),
                        created_at: now,
                        updated_at: now,
                    };
                    guard.records.insert(update.task_id, record.clone());
                    guard.order.push_back(update.task_id);
                    self.evict(&mut guard);
                    record
                }
            };
            record
        };
        let _ = self.changes.send(record.clone());
        Ok(record)
    }

    pub fn get(&self, task_id: &Uuid) -> Option<TaskRecord> {
        self.inner.lock().records.get(task_id).cloned()
    }

    pub fn recent(&self, limit: usize) -> Vec<TaskRecord> {
        let guard = self.inner.lock();
        guard
            .order
            .iter()
            .rev()
            .filter_map(|id| guard.records.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, state: &mut BoardState) {
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.records.remove(&oldest);
            }
        }
    }
}

impl StatusSink for StatusBoard {
    fn report_status(&self, update: StatusUpdate) -> Result<()> {
        self.apply(update).map(|_| ())
    }

    fn current(&self, task_id: &Uuid) -> Option<TaskStatus> {
        self.inner.lock().records.get(task_id).map(|record| record.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;
    use serde_json::json;

    #[test]
    fn regressions_are_rejected() {
        let board = StatusBoard::default();
        let task = Task::new(TaskKind::Chat, json!({}), "test");
        board.track(&task).unwrap();
        board
            .apply(StatusUpdate::new(task.id, TaskStatus::InProgress).with_agent("orchestrator"))
            .unwrap();
        let err = board
            .apply(StatusUpdate::new(task.id, TaskStatus::Dispatched))
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidTransition { .. }));

        let record = board
            .apply(
                StatusUpdate::new(task.id, TaskStatus::Completed)
                    .with_result(json!({ "ok": true })),
            )
            .unwrap();
        assert_eq!(record.assigned_to.as_deref(), Some("orchestrator"));
        assert_eq!(record.kind, "chat");
        assert!(board
            .apply(StatusUpdate::new(task.id, TaskStatus::Failed))
            .is_err());
    }

    #[test]
    fn history_is_bounded() {
        let board = StatusBoard::new(2);
        let tasks: Vec<Task> = (0..3)
            .map(|idx| Task::new(TaskKind::Chat, json!({ "idx": idx }), "test"))
            .collect();
        for task in &tasks {
            board.track(task).unwrap();
        }
        assert_eq!(board.len(), 2);
        assert!(board.get(&tasks[0].id).is_none());
        let recent = board.recent(10);
        assert_eq!(recent[0].task_id, tasks[2].id);
    }

    #[tokio::test]
    async fn changes_are_broadcast() {
        let board = StatusBoard::default();
        let mut changes = board.subscribe();
        let task = Task::new(TaskKind::Incident, json!({}), "monitoring");
        board.track(&task).unwrap();
        let record = changes.recv().await.unwrap();
        assert_eq!(record.task_id, task.id);
        assert_eq!(record.status, TaskStatus::Pending);
    }
}
