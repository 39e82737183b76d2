//! Task store contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::tasks::task::{TaskRecord, TaskStatus};

/// Task store failure
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unavailable or query failed
    #[error("task store backend error: {0}")]
    Backend(String),

    /// Referenced task does not exist
    #[error("task {0} not found")]
    NotFound(String),

    /// Payload could not be encoded or decoded
    #[error("task serialization error: {0}")]
    Serialization(String),
}

/// Durable queue backend
///
/// All operations are atomic per call. `claim_next` is the concurrency-
/// critical one: two workers polling the same queue must never both observe
/// a task as claimed.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Persist a new task record
    async fn save(&self, task: &TaskRecord) -> Result<(), StoreError>;

    /// Fetch a task by ID
    async fn get_by_id(&self, id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Atomically claim the next due task of a queue
    ///
    /// Selects one `Pending` task with `scheduled_for <= now`, ordered by
    /// priority descending then creation time ascending, transitions it to
    /// `Processing`, and stamps `worker_id` and `started_at`.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Overwrite an existing record
    async fn update(&self, task: &TaskRecord) -> Result<(), StoreError>;

    /// Fetch up to `limit` tasks in a state, ordered by due time
    async fn get_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Fetch up to `limit` tasks of a queue, ordered by creation time
    async fn get_by_queue(&self, queue: &str, limit: usize)
        -> Result<Vec<TaskRecord>, StoreError>;

    /// Delete terminal tasks that finished before `cutoff`; returns how many
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Count tasks in a state
    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, StoreError>;

    /// Reset abandoned `Processing` tasks to `Pending`
    ///
    /// Applies to tasks whose `started_at` is before `older_than`; clears
    /// `worker_id` and `started_at`. Returns how many were released.
    async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}
