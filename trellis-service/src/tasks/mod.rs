//! Durable background task queue
//!
//! Tasks are persisted through a [`TaskStore`], enqueued by the
//! [`TaskDispatcher`], and executed by a [`TaskWorker`] with priority +
//! scheduled claiming, exponential-backoff retries, and stale-lease
//! recovery. Delivery is at-least-once; handlers must be idempotent.

mod dispatcher;
mod events;
mod memory;
#[cfg(feature = "database")]
mod postgres;
mod registry;
mod store;
mod task;
mod worker;

pub use dispatcher::TaskDispatcher;
pub use events::{TaskEvent, TaskEvents};
pub use memory::InMemoryTaskStore;
#[cfg(feature = "database")]
pub use postgres::PgTaskStore;
pub use registry::{task_fn, TaskContext, TaskHandler, TaskRegistry};
pub use store::{StoreError, TaskStore};
pub use task::{EnqueueOptions, TaskPriority, TaskRecord, TaskStatus};
pub use worker::TaskWorker;
