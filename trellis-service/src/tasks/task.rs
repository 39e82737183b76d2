//! Task record model

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task record
///
/// Terminal states are `Completed`, `Failed`, and `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Ready to be claimed
    Pending,
    /// Waiting for its scheduled time (or a retry delay)
    Scheduled,
    /// Claimed by a worker; `worker_id` and `started_at` are set
    Processing,
    /// Handler succeeded
    Completed,
    /// Retries exhausted
    Failed,
    /// Cancelled before execution
    Cancelled,
    /// Marked for retry hand-off
    Retrying,
}

impl TaskStatus {
    /// Stable lowercase name, used for persistence
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        }
    }

    /// Parse a stored status name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "scheduled" => Some(Self::Scheduled),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }

    /// True for states no worker will touch again
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Claim ordering priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background housekeeping
    Low,
    /// Everyday work
    #[default]
    Normal,
    /// Ahead of normal traffic
    High,
    /// Claimed before everything else
    Critical,
}

impl TaskPriority {
    /// Integer weight used for claim ordering (higher first)
    #[must_use]
    pub fn weight(&self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Normal => 5,
            Self::High => 10,
            Self::Critical => 20,
        }
    }

    /// Reconstruct a priority from its stored weight
    #[must_use]
    pub fn from_weight(weight: i32) -> Self {
        match weight {
            w if w >= 20 => Self::Critical,
            w if w >= 10 => Self::High,
            w if w >= 5 => Self::Normal,
            _ => Self::Low,
        }
    }
}

/// Durable description of a queued background job
///
/// Invariants: `Processing` rows always carry `worker_id` and `started_at`;
/// `scheduled_for` is never before `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task ID
    pub id: String,
    /// Registered handler name
    pub name: String,
    /// Queue the task belongs to
    pub queue: String,
    /// Opaque handler payload
    pub args: serde_json::Value,
    /// Lifecycle state
    pub status: TaskStatus,
    /// Claim ordering priority
    pub priority: TaskPriority,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Earliest execution time
    pub scheduled_for: DateTime<Utc>,
    /// When a worker claimed the task
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Handler result on success
    pub result: Option<serde_json::Value>,
    /// Last error message
    pub error: Option<String>,
    /// Last error context
    pub stack_trace: Option<String>,
    /// Retries consumed so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Claiming worker, while `Processing`
    pub worker_id: Option<String>,
    /// Hard execution timeout in milliseconds
    pub timeout_ms: u64,
    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

impl TaskRecord {
    /// Hard execution timeout as a `Duration`
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Options accepted by [`TaskDispatcher::enqueue`](crate::tasks::TaskDispatcher::enqueue)
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Target queue; the dispatcher default applies when absent
    pub queue: Option<String>,
    /// Claim priority
    pub priority: TaskPriority,
    /// Delay before the task becomes due
    pub delay: Option<Duration>,
    /// Absolute due time; wins over `delay`
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Retry budget override
    pub max_retries: Option<u32>,
    /// Execution timeout override
    pub timeout: Option<Duration>,
    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Scheduled,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Retrying,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Scheduled.is_terminal());
    }

    #[test]
    fn test_priority_weights_ordered() {
        assert!(TaskPriority::Critical.weight() > TaskPriority::High.weight());
        assert!(TaskPriority::High.weight() > TaskPriority::Normal.weight());
        assert!(TaskPriority::Normal.weight() > TaskPriority::Low.weight());
    }

    #[test]
    fn test_priority_from_weight() {
        for priority in [
            TaskPriority::Low,
            TaskPriority::Normal,
            TaskPriority::High,
            TaskPriority::Critical,
        ] {
            assert_eq!(TaskPriority::from_weight(priority.weight()), priority);
        }
    }
}
