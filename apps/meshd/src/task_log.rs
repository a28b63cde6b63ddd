use std::time::Duration;

use agentmesh::status::TaskRecord;
use agentmesh::task::TaskStatus;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS task_log (\
    task_id UUID PRIMARY KEY, \
    kind TEXT NOT NULL, \
    status TEXT NOT NULL, \
    assigned_to TEXT, \
    reason TEXT, \
    result JSONB, \
    attempts INTEGER NOT NULL DEFAULT 0, \
    created_at TIMESTAMPTZ NOT NULL, \
    updated_at TIMESTAMPTZ NOT NULL)";

/// Postgres mirror of the status board. Outlives the board's bounded history.
#[derive(Clone)]
pub struct TaskLog {
    pool: PgPool,
}

impl TaskLog {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn upsert(&self, record: &TaskRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO task_log \
             (task_id, kind, status, assigned_to, reason, result, attempts, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (task_id) DO UPDATE SET status = EXCLUDED.status, \
             assigned_to = EXCLUDED.assigned_to, \
             reason = EXCLUDED.reason, result = EXCLUDED.result, attempts = EXCLUDED.attempts, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(record.task_id)
        .bind(&record.kind)
        .bind(record.status.to_string())
        .bind(record.assigned_to.as_deref())
        .bind(record.reason.as_deref())
        .bind(record.result.clone().map(Json))
        .bind(record.attempts as i32)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch(&self, task_id: Uuid) -> anyhow::Result<Option<TaskRecord>> {
        let row = sqlx::query(
            "SELECT task_id, kind, status, assigned_to, reason, result, attempts, \
             created_at, updated_at \
             FROM task_log WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.get("status");
        let status: TaskStatus = serde_json::from_value(Value::String(status))?;
        let result: Option<Json<Value>> = row.get("result");
        let attempts: i32 = row.get("attempts");
        let created_at: DateTime<Utc> = row.get("created_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");
        Ok(Some(TaskRecord {
            task_id: row.get("task_id"),
            kind: row.get("kind"),
            status,
            assigned_to: row.get("assigned_to"),
            reason: row.get("reason"),
            result: result.map(|Json(value)| value),
            attempts: attempts.max(0) as u32,
            created_at,
            updated_at,
        }))
    }

    /// Writes every board change until shutdown. Lagging drops changes but
    /// the next change of the same task overwrites its row anyway.
    pub async fn mirror(
        self,
        mut changes: broadcast::Receiver<TaskRecord>,
        shutdown: CancellationToken,
    ) {
        info!("task log mirror started");
        loop {
            let record = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = changes.recv() => received,
            };
            match record {
                Ok(record) => {
                    if let Err(err) = self.upsert(&record).await {
                        warn!(task_id = %record.task_id, "failed to persist task status: {err}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "task log mirror fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("task log mirror stopped");
    }
}
