//! Step-execution task and transport traits

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lease on a received delivery before the transport hands it out again
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// The queue no longer accepts or yields tasks
    #[error("queue is closed")]
    Closed,
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Message asking an executor to run one step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTask {
    pub process_id: i64,
    pub step_name: String,
}

impl StepTask {
    pub fn new(process_id: i64, step_name: impl Into<String>) -> Self {
        Self {
            process_id,
            step_name: step_name.into(),
        }
    }
}

impl std::fmt::Display for StepTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.process_id, self.step_name)
    }
}

/// A task handed to a consumer
///
/// Must be acknowledged or negatively acknowledged; unacknowledged
/// deliveries are redelivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Transport-assigned delivery id
    pub id: i64,

    pub task: StepTask,

    /// Delivery attempt (1-based)
    pub attempt: u32,
}

/// Outcome of negatively acknowledging a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// Task will be redelivered after `delay`
    Retry { next_attempt: u32, delay: Duration },

    /// Retries exhausted; task moved to the dead-letter state
    Dead,
}

/// Producer side of the step-execution transport
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Publish a task (at-least-once)
    async fn dispatch(&self, task: StepTask) -> Result<(), QueueError>;
}

/// Consumer side of the step-execution transport
#[async_trait]
pub trait TaskSource: Send + Sync + 'static {
    /// Receive up to `max` visible tasks
    async fn receive(&self, consumer_id: &str, max: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledge successful handling
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Report failed handling; the queue's retry policy decides what happens next
    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, QueueError>;
}
