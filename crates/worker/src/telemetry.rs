// Logging setup for the worker binary

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "procflow_durable=debug,procflow_worker=debug";

/// Resolve the log filter: `RUST_LOG`, then `PROCFLOW_LOG`, then the default
pub fn log_filter() -> String {
    std::env::var("RUST_LOG")
        .ok()
        .or_else(|| std::env::var("PROCFLOW_LOG").ok())
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Install the global fmt subscriber
///
/// An unparsable filter falls back to the default and is reported once the
/// subscriber is up.
pub fn init_telemetry() {
    let requested = log_filter();
    let (filter, rejected) = match EnvFilter::try_new(&requested) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(DEFAULT_FILTER), Some(e.to_string())),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .init();

    if let Some(error) = rejected {
        tracing::warn!(filter = %requested, error = %error, "Invalid log filter, using default");
    }
}
