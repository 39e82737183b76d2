//! Task handler registry
//!
//! Built at startup, read-only afterwards. `enqueue` refuses names that are
//! not registered here.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::tasks::task::TaskRecord;

/// Execution context handed to a task handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// The task's ID
    pub task_id: String,
    /// Handler payload as enqueued
    pub args: serde_json::Value,
    /// Retries consumed before this attempt
    pub retry_count: u32,
    /// Free-form metadata from enqueue time
    pub metadata: HashMap<String, String>,
}

impl TaskContext {
    pub(crate) fn for_task(task: &TaskRecord) -> Self {
        Self {
            task_id: task.id.clone(),
            args: task.args.clone(),
            retry_count: task.retry_count,
            metadata: task.metadata.clone(),
        }
    }
}

/// A background job implementation
///
/// Delivery is at-least-once: a worker crashing between handler success and
/// the store update re-runs the task, so handlers must be idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Execute one attempt; the returned value is stored on the record
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<serde_json::Value>;
}

/// Wrap a closure as a [`TaskHandler`]
pub fn task_fn<F, Fut>(f: F) -> impl TaskHandler
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> TaskHandler for FnHandler<F>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        async fn run(&self, ctx: TaskContext) -> anyhow::Result<serde_json::Value> {
            (self.0)(ctx).await
        }
    }

    FnHandler(f)
}

/// Name-to-handler map
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing a previous registration
    pub fn register(&mut self, name: impl Into<String>, handler: impl TaskHandler) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Look up a handler
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    /// True when `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All registered names
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_run() {
        let mut registry = TaskRegistry::new();
        registry.register(
            "double",
            task_fn(|ctx: TaskContext| async move {
                let n = ctx.args.as_i64().unwrap_or(0);
                Ok(serde_json::json!(n * 2))
            }),
        );

        assert!(registry.contains("double"));
        assert!(!registry.contains("triple"));

        let handler = registry.get("double").unwrap();
        let ctx = TaskContext {
            task_id: "t".to_string(),
            args: serde_json::json!(21),
            retry_count: 0,
            metadata: HashMap::new(),
        };
        assert_eq!(handler.run(ctx).await.unwrap(), serde_json::json!(42));
    }
}
