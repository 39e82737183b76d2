//! Task dispatcher: validated enqueue into the store

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::error::{Error, Result};
use crate::tasks::registry::TaskRegistry;
use crate::tasks::store::TaskStore;
use crate::tasks::task::{EnqueueOptions, TaskRecord, TaskStatus};

/// Hands validated task records to the store
///
/// Enqueueing a name with no registered handler is refused up front rather
/// than failing later in a worker.
#[derive(Clone)]
pub struct TaskDispatcher {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    default_queue: String,
    default_max_retries: u32,
    default_timeout_ms: u64,
}

impl TaskDispatcher {
    /// Create a dispatcher over a store and handler registry
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            store,
            registry,
            default_queue: settings
                .queues
                .first()
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
            default_max_retries: settings.default_max_retries,
            default_timeout_ms: settings.default_timeout_ms,
        }
    }

    /// Enqueue a task, returning its ID
    ///
    /// The task lands `Scheduled` when its due time is in the future,
    /// `Pending` otherwise.
    pub async fn enqueue(
        &self,
        name: &str,
        args: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        if !self.registry.contains(name) {
            return Err(Error::UnknownTask(name.to_string()));
        }

        let now = Utc::now();
        let requested = options.scheduled_for.unwrap_or_else(|| {
            let delay = options
                .delay
                .and_then(|d| ChronoDuration::from_std(d).ok())
                .unwrap_or_else(ChronoDuration::zero);
            now + delay
        });
        // Keep the scheduled_for >= created_at invariant for past due times
        let scheduled_for = requested.max(now);

        let status = if scheduled_for > now {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };

        let task = TaskRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            queue: options
                .queue
                .unwrap_or_else(|| self.default_queue.clone()),
            args,
            status,
            priority: options.priority,
            created_at: now,
            scheduled_for,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            stack_trace: None,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.default_max_retries),
            worker_id: None,
            timeout_ms: options
                .timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(self.default_timeout_ms),
            metadata: options.metadata,
        };

        self.store.save(&task).await?;
        tracing::debug!(
            task_id = %task.id,
            name = %task.name,
            queue = %task.queue,
            status = %task.status,
            "task enqueued"
        );
        Ok(task.id)
    }

    /// Cancel a task that has not started yet
    ///
    /// Returns `true` when the task was cancelled, `false` when it already
    /// ran or is running.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let Some(mut task) = self.store.get_by_id(task_id).await? else {
            return Err(Error::not_found(format!("task {task_id}")));
        };

        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Scheduled) {
            return Ok(false);
        }

        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        self.store.update(&task).await?;
        tracing::info!(task_id = %task_id, "task cancelled");
        Ok(true)
    }

    /// Fetch a task record by ID
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.store.get_by_id(task_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::memory::InMemoryTaskStore;
    use crate::tasks::registry::{task_fn, TaskContext};
    use std::time::Duration;

    fn dispatcher() -> (TaskDispatcher, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut registry = TaskRegistry::new();
        registry.register(
            "noop",
            task_fn(|_ctx: TaskContext| async move { Ok(serde_json::Value::Null) }),
        );
        let dispatcher = TaskDispatcher::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            Arc::new(registry),
            &WorkerSettings::default(),
        );
        (dispatcher, store)
    }

    #[tokio::test]
    async fn test_enqueue_immediate_is_pending() {
        let (dispatcher, store) = dispatcher();
        let id = dispatcher
            .enqueue("noop", serde_json::json!({"k": 1}), EnqueueOptions::default())
            .await
            .unwrap();

        let task = store.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.queue, "default");
        assert!(task.scheduled_for >= task.created_at);
    }

    #[tokio::test]
    async fn test_enqueue_delayed_is_scheduled() {
        let (dispatcher, store) = dispatcher();
        let id = dispatcher
            .enqueue(
                "noop",
                serde_json::Value::Null,
                EnqueueOptions {
                    delay: Some(Duration::from_secs(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let task = store.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert!(task.scheduled_for > task.created_at);
    }

    #[tokio::test]
    async fn test_unknown_task_refused() {
        let (dispatcher, _store) = dispatcher();
        let err = dispatcher
            .enqueue("ghost", serde_json::Value::Null, EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTask(_)));
    }

    #[tokio::test]
    async fn test_past_schedule_clamped_to_now() {
        let (dispatcher, store) = dispatcher();
        let id = dispatcher
            .enqueue(
                "noop",
                serde_json::Value::Null,
                EnqueueOptions {
                    scheduled_for: Some(Utc::now() - ChronoDuration::seconds(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let task = store.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.scheduled_for >= task.created_at);
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let (dispatcher, store) = dispatcher();
        let id = dispatcher
            .enqueue("noop", serde_json::Value::Null, EnqueueOptions::default())
            .await
            .unwrap();

        assert!(dispatcher.cancel(&id).await.unwrap());
        let task = store.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.completed_at.is_some());

        // A second cancel is a no-op
        assert!(!dispatcher.cancel(&id).await.unwrap());
    }
}
