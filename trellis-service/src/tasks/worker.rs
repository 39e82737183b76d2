//! Task worker: poll loops, scheduled promotion, stale recovery
//!
//! One poll loop per configured queue claims due tasks under a bounded
//! in-flight budget; a promoter loop moves due `Scheduled` tasks to
//! `Pending`; a stale loop recovers `Processing` tasks whose worker died.
//! `stop` halts polling immediately and drains in-flight handlers up to a
//! timeout; whatever remains stays `Processing` for the stale releaser.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::tasks::events::{TaskEvent, TaskEvents};
use crate::tasks::registry::{TaskContext, TaskRegistry};
use crate::tasks::store::TaskStore;
use crate::tasks::task::{TaskRecord, TaskStatus};

const PROMOTION_PAGE: usize = 100;

/// Background task worker
///
/// Construct, wrap in `Arc`, and `start()`; `start` blocks until `stop` is
/// called.
pub struct TaskWorker {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    events: TaskEvents,
    config: WorkerSettings,
    worker_id: String,
    cancel: CancellationToken,
    hard_cancel: CancellationToken,
    inflight: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl TaskWorker {
    /// Create a worker over a store and registry
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        events: TaskEvents,
        config: WorkerSettings,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            store,
            registry,
            events,
            config,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            cancel: CancellationToken::new(),
            hard_cancel: CancellationToken::new(),
            inflight: Arc::new(Semaphore::new(concurrency)),
            tracker: TaskTracker::new(),
        }
    }

    /// This worker's unique ID, stamped on claimed tasks
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run all loops; blocks until [`TaskWorker::stop`]
    pub async fn start(self: Arc<Self>) {
        for queue in self.config.queues.clone() {
            let worker = Arc::clone(&self);
            self.tracker.spawn(worker.poll_loop(queue));
        }
        let worker = Arc::clone(&self);
        self.tracker.spawn(worker.promoter_loop());
        let worker = Arc::clone(&self);
        self.tracker.spawn(worker.stale_loop());

        tracing::info!(
            worker_id = %self.worker_id,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "task worker started"
        );

        self.cancel.cancelled().await;
    }

    /// Stop polling immediately and drain in-flight handlers
    ///
    /// Handlers still running after `timeout` are abandoned; their tasks
    /// remain `Processing` until the stale releaser recovers them.
    pub async fn stop(&self, timeout: Duration) {
        tracing::info!(worker_id = %self.worker_id, "task worker stopping");
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                worker_id = %self.worker_id,
                "drain timed out, abandoning in-flight tasks"
            );
            self.hard_cancel.cancel();
        } else {
            tracing::info!(worker_id = %self.worker_id, "task worker drained");
        }
    }

    /// Sleep for `duration` unless stopped first; returns true when stopped
    async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(duration) => false,
        }
    }

    async fn poll_loop(self: Arc<Self>, queue: String) {
        tracing::debug!(queue = %queue, "poll loop started");
        loop {
            let permit = tokio::select! {
                () = self.cancel.cancelled() => break,
                permit = Arc::clone(&self.inflight).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
            };

            match self.store.claim_next(&queue, &self.worker_id).await {
                Ok(Some(task)) => {
                    let worker = Arc::clone(&self);
                    self.tracker.spawn(async move {
                        let _permit = permit;
                        worker.execute(task).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if self.idle(self.config.poll_interval()).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(queue = %queue, error = %e, "claim failed, backing off");
                    if self.idle(self.config.poll_interval()).await {
                        break;
                    }
                }
            }
        }
        tracing::debug!(queue = %queue, "poll loop stopped");
    }

    async fn promoter_loop(self: Arc<Self>) {
        loop {
            if self.idle(self.config.schedule_check_interval()).await {
                break;
            }
            match self
                .store
                .get_by_status(TaskStatus::Scheduled, PROMOTION_PAGE)
                .await
            {
                Ok(page) => {
                    let now = Utc::now();
                    for mut task in page {
                        if task.scheduled_for > now {
                            continue;
                        }
                        task.status = TaskStatus::Pending;
                        if let Err(e) = self.store.update(&task).await {
                            tracing::warn!(task_id = %task.id, error = %e, "promotion failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "scheduled scan failed");
                }
            }
        }
    }

    async fn stale_loop(self: Arc<Self>) {
        loop {
            if self.idle(self.config.stale_check_interval()).await {
                break;
            }
            let cutoff = Utc::now()
                - ChronoDuration::from_std(self.config.stale_timeout())
                    .unwrap_or_else(|_| ChronoDuration::zero());
            if let Err(e) = self.store.release_stale(cutoff).await {
                tracing::warn!(error = %e, "stale release failed");
            }
        }
    }

    async fn execute(&self, mut task: TaskRecord) {
        let Some(handler) = self.registry.get(&task.name) else {
            tracing::error!(task_id = %task.id, name = %task.name, "no handler registered");
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            task.error = Some(format!("no handler registered for task: {}", task.name));
            if let Err(e) = self.store.update(&task).await {
                tracing::error!(task_id = %task.id, error = %e, "failed to persist failure");
            }
            return;
        };

        self.events.emit(TaskEvent::Started {
            task_id: task.id.clone(),
            name: task.name.clone(),
        });
        tracing::debug!(task_id = %task.id, name = %task.name, "task started");

        let ctx = TaskContext::for_task(&task);
        let outcome = tokio::select! {
            biased;
            () = self.hard_cancel.cancelled() => {
                tracing::info!(task_id = %task.id, "abandoning task mid-flight");
                return;
            }
            outcome = tokio::time::timeout(task.timeout(), handler.run(ctx)) => outcome,
        };

        match outcome {
            Ok(Ok(value)) => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                task.result = Some(value);
                task.error = None;
                if let Err(e) = self.store.update(&task).await {
                    tracing::error!(task_id = %task.id, error = %e, "failed to persist completion");
                    return;
                }
                self.events.emit(TaskEvent::Completed {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                });
                tracing::info!(task_id = %task.id, name = %task.name, "task completed");
            }
            Ok(Err(e)) => {
                let stack = format!("{e:?}");
                self.handle_failure(task, e.to_string(), Some(stack)).await;
            }
            Err(_elapsed) => {
                let message = format!("task timed out after {}ms", task.timeout_ms);
                self.handle_failure(task, message, None).await;
            }
        }
    }

    async fn handle_failure(&self, mut task: TaskRecord, error: String, stack: Option<String>) {
        if task.retry_count < task.max_retries {
            let delay = self.backoff_delay(task.retry_count);
            task.status = TaskStatus::Scheduled;
            task.scheduled_for = Utc::now()
                + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
            task.retry_count += 1;
            task.error = Some(error.clone());
            task.stack_trace = stack;
            task.worker_id = None;
            task.started_at = None;

            if let Err(e) = self.store.update(&task).await {
                tracing::error!(task_id = %task.id, error = %e, "failed to persist retry");
                return;
            }
            self.events.emit(TaskEvent::Retried {
                task_id: task.id.clone(),
                name: task.name.clone(),
                retry_count: task.retry_count,
                delay_ms: delay.as_millis() as u64,
            });
            tracing::warn!(
                task_id = %task.id,
                name = %task.name,
                retry_count = task.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "task failed, retry scheduled"
            );
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            task.error = Some(error.clone());
            task.stack_trace = stack;

            if let Err(e) = self.store.update(&task).await {
                tracing::error!(task_id = %task.id, error = %e, "failed to persist failure");
                return;
            }
            self.events.emit(TaskEvent::Failed {
                task_id: task.id.clone(),
                name: task.name.clone(),
                error: error.clone(),
            });
            tracing::error!(
                task_id = %task.id,
                name = %task.name,
                retry_count = task.retry_count,
                error = %error,
                "task failed permanently"
            );
        }
    }

    /// `min(base × multiplier^attempt, max)`, jittered by uniform [0.5, 1.0]
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let factor = self.config.backoff_multiplier.powi(attempt as i32);
        let capped = (base * factor).min(self.config.max_delay_ms as f64);
        let delayed = if self.config.use_jitter {
            capped * rand::rng().random_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_millis(delayed.round() as u64)
    }
}
