//! Postgres-backed durable task store
//!
//! One `tasks` table with secondary indexes on status, queue, due time, and
//! the claim ordering. `claim_next` relies on `FOR UPDATE SKIP LOCKED` so
//! concurrent workers never observe the same row.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::tasks::store::{StoreError, TaskStore};
use crate::tasks::task::{TaskPriority, TaskRecord, TaskStatus};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id            TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        queue         TEXT NOT NULL,
        args          JSONB NOT NULL,
        status        TEXT NOT NULL,
        priority      INT NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL,
        scheduled_for TIMESTAMPTZ NOT NULL,
        started_at    TIMESTAMPTZ,
        completed_at  TIMESTAMPTZ,
        result        JSONB,
        error         TEXT,
        stack_trace   TEXT,
        retry_count   INT NOT NULL,
        max_retries   INT NOT NULL,
        worker_id     TEXT,
        timeout_ms    BIGINT NOT NULL,
        metadata      JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks (queue)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_scheduled_for ON tasks (scheduled_for)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (priority DESC, created_at ASC)",
];

/// Postgres task store
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    /// Wrap an existing pool
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connection_timeout_secs))
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "task store database pool connected"
        );
        Ok(Self { pool })
    }

    /// Create the tasks table and its indexes when missing
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("task store schema ready");
        Ok(())
    }

    /// The underlying pool
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_task(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Serialization(format!("unknown status: {status_text}")))?;

    let metadata: serde_json::Value = row.try_get("metadata")?;
    let metadata: HashMap<String, String> = serde_json::from_value(metadata)
        .map_err(|e| StoreError::Serialization(format!("bad metadata: {e}")))?;

    Ok(TaskRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        queue: row.try_get("queue")?,
        args: row.try_get("args")?,
        status,
        priority: TaskPriority::from_weight(row.try_get::<i32, _>("priority")?),
        created_at: row.try_get("created_at")?,
        scheduled_for: row.try_get("scheduled_for")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        stack_trace: row.try_get("stack_trace")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        worker_id: row.try_get("worker_id")?,
        timeout_ms: row.try_get::<i64, _>("timeout_ms")? as u64,
        metadata,
    })
}

fn metadata_value(task: &TaskRecord) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(&task.metadata)
        .map_err(|e| StoreError::Serialization(format!("bad metadata: {e}")))
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn save(&self, task: &TaskRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tasks (
                id, name, queue, args, status, priority, created_at,
                scheduled_for, started_at, completed_at, result, error,
                stack_trace, retry_count, max_retries, worker_id, timeout_ms,
                metadata
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18
            )",
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.queue)
        .bind(&task.args)
        .bind(task.status.as_str())
        .bind(task.priority.weight())
        .bind(task.created_at)
        .bind(task.scheduled_for)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.result)
        .bind(&task.error)
        .bind(&task.stack_trace)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(&task.worker_id)
        .bind(task.timeout_ms as i64)
        .bind(metadata_value(task)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(
            "UPDATE tasks
             SET status = 'processing', worker_id = $2, started_at = now()
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status = 'pending' AND queue = $1 AND scheduled_for <= now()
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(queue)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn update(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET
                name = $2, queue = $3, args = $4, status = $5, priority = $6,
                created_at = $7, scheduled_for = $8, started_at = $9,
                completed_at = $10, result = $11, error = $12,
                stack_trace = $13, retry_count = $14, max_retries = $15,
                worker_id = $16, timeout_ms = $17, metadata = $18
             WHERE id = $1",
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.queue)
        .bind(&task.args)
        .bind(task.status.as_str())
        .bind(task.priority.weight())
        .bind(task.created_at)
        .bind(task.scheduled_for)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.result)
        .bind(&task.error)
        .bind(&task.stack_trace)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(&task.worker_id)
        .bind(task.timeout_ms as i64)
        .bind(metadata_value(task)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(task.id.clone()));
        }
        Ok(())
    }

    async fn get_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = $1 ORDER BY scheduled_for ASC LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn get_by_queue(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE queue = $1 ORDER BY created_at ASC LIMIT $2",
        )
        .bind(queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM tasks
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND completed_at IS NOT NULL AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM tasks WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("count")? as u64)
    }

    async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'pending', worker_id = NULL, started_at = NULL
             WHERE status = 'processing' AND started_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            tracing::info!(released, "stale processing tasks released");
        }
        Ok(released)
    }
}
