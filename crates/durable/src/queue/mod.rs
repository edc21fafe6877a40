//! Step-execution task transport
//!
//! The orchestrator publishes [`StepTask`]s through [`TaskQueue`]; workers
//! consume them through [`TaskSource`]. Delivery is at-least-once: tasks may
//! arrive more than once and out of order.
//!
//! - [`PostgresTaskQueue`] - durable queue table with SKIP LOCKED consumption
//! - [`InMemoryTaskQueue`] - for tests
//!
//! A delivery that is neither acked nor nacked within the queue's visibility
//! timeout becomes receivable again.

mod memory;
mod postgres;
mod task;

pub use memory::InMemoryTaskQueue;
pub use postgres::PostgresTaskQueue;
pub use task::{
    Delivery, NackOutcome, QueueError, StepTask, TaskQueue, TaskSource, DEFAULT_VISIBILITY_TIMEOUT,
};
