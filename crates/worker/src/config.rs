//! Configuration loading from environment variables.

use std::time::Duration;

/// Worker service configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Maximum step tasks executed concurrently
    pub max_concurrency: usize,
    /// Scheduled jobs leased per poll
    pub job_batch_size: usize,
    /// Idle wait between job polls
    pub job_poll_interval: Duration,
    /// Claim attempts before a RUNNING step's redelivery is dropped
    pub max_claim_attempts: u32,
    /// Apply migrations on startup
    pub run_migrations: bool,
    /// Simulated work per sample step
    pub step_delay: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `PROCFLOW_DATABASE_URL` (or `DATABASE_URL`): PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `PROCFLOW_MAX_CONCURRENCY`: concurrent step tasks (default: 10)
    /// - `PROCFLOW_JOB_BATCH_SIZE`: jobs leased per poll (default: 10)
    /// - `PROCFLOW_JOB_POLL_INTERVAL_MS`: idle job poll interval (default: 1000)
    /// - `PROCFLOW_MAX_CLAIM_ATTEMPTS`: redelivery bound for RUNNING steps (default: 1)
    /// - `PROCFLOW_RUN_MIGRATIONS`: apply migrations on startup (default: true)
    /// - `PROCFLOW_STEP_DELAY_MS`: simulated work per sample step (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("PROCFLOW_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::Missing("PROCFLOW_DATABASE_URL"))?;

        let max_concurrency: usize =
            parse_var("PROCFLOW_MAX_CONCURRENCY", "10", "must be a positive integer")?;
        if max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "PROCFLOW_MAX_CONCURRENCY",
                "must be a positive integer",
            ));
        }

        let job_batch_size: usize =
            parse_var("PROCFLOW_JOB_BATCH_SIZE", "10", "must be a positive integer")?;
        if job_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "PROCFLOW_JOB_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let job_poll_interval_ms: u64 = parse_var(
            "PROCFLOW_JOB_POLL_INTERVAL_MS",
            "1000",
            "must be a number of milliseconds",
        )?;

        let max_claim_attempts: u32 = parse_var(
            "PROCFLOW_MAX_CLAIM_ATTEMPTS",
            "1",
            "must be a non-negative integer",
        )?;

        let run_migrations: bool =
            parse_var("PROCFLOW_RUN_MIGRATIONS", "true", "must be true or false")?;

        let step_delay_ms: u64 = parse_var(
            "PROCFLOW_STEP_DELAY_MS",
            "1000",
            "must be a number of milliseconds",
        )?;

        Ok(Self {
            database_url,
            max_concurrency,
            job_batch_size,
            job_poll_interval: Duration::from_millis(job_poll_interval_ms),
            max_claim_attempts,
            run_migrations,
            step_delay: Duration::from_millis(step_delay_ms),
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(key, reason))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
