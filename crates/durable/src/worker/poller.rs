//! Step-task polling with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::queue::{Delivery, QueueError, TaskSource};
use crate::util::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while tasks keep arriving
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling while idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no tasks were found
    pub backoff_multiplier: f64,

    /// Maximum tasks to receive per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Task poller with adaptive backoff
///
/// Backs off exponentially while the source is empty and snaps back to the
/// minimum interval as soon as a task is received.
pub struct TaskPoller {
    source: Arc<dyn TaskSource>,
    consumer_id: String,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        source: Arc<dyn TaskSource>,
        consumer_id: impl Into<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            consumer_id: consumer_id.into(),
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Receive up to `max_tasks` deliveries and update the backoff state
    #[instrument(skip(self), fields(consumer_id = %self.consumer_id))]
    pub async fn poll(&mut self, max_tasks: usize) -> Result<Vec<Delivery>, PollerError> {
        if self.is_shutdown() {
            debug!("poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_tasks.min(self.config.batch_size);
        let deliveries = self.source.receive(&self.consumer_id, batch_size).await?;

        if deliveries.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "no tasks, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = deliveries.len(), "received step tasks");
        }

        Ok(deliveries)
    }

    /// Sleep for the current interval
    ///
    /// Returns `true` if shutdown was signalled while waiting.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}
