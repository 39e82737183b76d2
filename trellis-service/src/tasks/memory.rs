//! In-memory task store for tests and single-process deployments

use std::cmp::Reverse;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::tasks::store::{StoreError, TaskStore};
use crate::tasks::task::{TaskRecord, TaskStatus};

/// Mutex-backed store; the lock makes every operation, including
/// `claim_next`, atomic.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, any status
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// True when nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &TaskRecord) -> Result<(), StoreError> {
        self.tasks
            .lock()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.lock().await;

        let candidate = tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending && t.queue == queue && t.scheduled_for <= now
            })
            .min_by_key(|t| (Reverse(t.priority.weight()), t.created_at))
            .map(|t| t.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };

        let task = tasks.get_mut(&id).expect("claimed id exists under lock");
        task.status = TaskStatus::Processing;
        task.worker_id = Some(worker_id.to_string());
        task.started_at = Some(now);
        Ok(Some(task.clone()))
    }

    async fn update(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.contains_key(&task.id) {
            return Err(StoreError::NotFound(task.id.clone()));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.lock().await;
        let mut matched: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.scheduled_for);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn get_by_queue(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.lock().await;
        let mut matched: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.queue == queue)
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.created_at);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.status.is_terminal() && t.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - tasks.len()) as u64)
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, StoreError> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.values().filter(|t| t.status == status).count() as u64)
    }

    async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let mut released = 0;
        for task in tasks.values_mut() {
            if task.status == TaskStatus::Processing
                && task.started_at.is_some_and(|at| at < older_than)
            {
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.started_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}
