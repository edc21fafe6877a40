//! Redelivery policy for the step-task queue

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::duration_millis;

/// How a queue redelivers a task whose handling failed
///
/// This governs transport-level redelivery only. Whether a redelivered task
/// actually re-runs its step is decided by the claim protocol.
///
/// # Example
///
/// ```
/// use procflow_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// assert!(policy.has_attempts_remaining(4));
/// assert!(!policy.has_attempts_remaining(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of deliveries (including the first)
    pub max_attempts: u32,

    /// Delay before the first redelivery
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound on the redelivery delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Multiplier applied per redelivery
    pub backoff_coefficient: f64,

    /// Relative jitter (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 5 deliveries, 1s initial delay doubling up to 60s, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Deliver once; failures go straight to the dead-letter state
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Constant delay between deliveries
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before delivery number `attempt` (1-based; the first delivery is immediate)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter;
            (capped + rand::thread_rng().gen_range(-spread..spread)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether another delivery is allowed after `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}
