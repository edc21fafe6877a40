//! Reliability patterns for step-task delivery
//!
//! This module provides:
//! - [`RetryPolicy`] - Queue redelivery with exponential backoff

mod retry;

pub use retry::RetryPolicy;
