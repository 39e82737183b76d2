//! Task lifecycle events

use tokio::sync::broadcast;

/// A task lifecycle transition observed by the worker
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A worker began executing the task
    Started {
        /// Task ID
        task_id: String,
        /// Handler name
        name: String,
    },
    /// The handler succeeded
    Completed {
        /// Task ID
        task_id: String,
        /// Handler name
        name: String,
    },
    /// The attempt failed and a retry was scheduled
    Retried {
        /// Task ID
        task_id: String,
        /// Handler name
        name: String,
        /// Retries consumed after this failure
        retry_count: u32,
        /// Backoff delay before the next attempt, in milliseconds
        delay_ms: u64,
    },
    /// Retries exhausted
    Failed {
        /// Task ID
        task_id: String,
        /// Handler name
        name: String,
        /// Final error message
        error: String,
    },
}

/// Broadcast fan-out of task events
///
/// Subscribers that fall behind lose the oldest events; the queue itself is
/// never blocked by a slow listener.
#[derive(Debug, Clone)]
pub struct TaskEvents {
    tx: broadcast::Sender<TaskEvent>,
}

impl TaskEvents {
    /// Create an event bus retaining up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; having no subscribers is not an error
    pub fn emit(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for TaskEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_fan_out() {
        let events = TaskEvents::new(8);
        let mut rx1 = events.subscribe();
        let mut rx2 = events.subscribe();

        events.emit(TaskEvent::Started {
            task_id: "t1".to_string(),
            name: "job".to_string(),
        });

        assert!(matches!(rx1.recv().await, Ok(TaskEvent::Started { .. })));
        assert!(matches!(rx2.recv().await, Ok(TaskEvent::Started { .. })));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let events = TaskEvents::new(8);
        events.emit(TaskEvent::Completed {
            task_id: "t1".to_string(),
            name: "job".to_string(),
        });
    }
}
