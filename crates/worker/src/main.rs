use std::sync::Arc;

use anyhow::{bail, Context, Result};
use procflow_durable::engine::{ExecutorConfig, GraphRegistry, StepExecutor, StepRegistry};
use procflow_durable::persistence::{PostgresProcessStore, ProcessStore};
use procflow_durable::queue::{PostgresTaskQueue, TaskQueue, TaskSource};
use procflow_durable::worker::{JobPoller, JobPollerConfig, WorkerPool, WorkerPoolConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

mod config;
mod order;
mod telemetry;

use config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG or PROCFLOW_LOG
    // (default: "procflow_durable=debug,procflow_worker=debug")
    telemetry::init_telemetry();

    tracing::info!("procflow-worker starting...");

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections((config.max_concurrency as u32).saturating_add(4))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let store = PostgresProcessStore::new(pool.clone());
    if config.run_migrations {
        store.migrate().await.context("Failed to run migrations")?;
        tracing::info!("Migrations applied");
    }
    let store: Arc<dyn ProcessStore> = Arc::new(store);

    let queue = Arc::new(PostgresTaskQueue::new(pool));
    let producer: Arc<dyn TaskQueue> = queue.clone();
    let source: Arc<dyn TaskSource> = queue;

    let graph = order::order_graph().context("Invalid order process graph")?;
    let mut steps = StepRegistry::new();
    order::register_order_handlers(&mut steps, config.step_delay);
    let missing = steps.missing_for(&graph);
    if !missing.is_empty() {
        bail!("No handler registered for steps: {}", missing.join(", "));
    }
    let mut graphs = GraphRegistry::new();
    graphs.register(graph);

    let executor = Arc::new(StepExecutor::with_config(
        store.clone(),
        producer.clone(),
        steps,
        graphs,
        ExecutorConfig::default().with_max_claim_attempts(config.max_claim_attempts),
    ));

    let worker_pool = WorkerPool::new(
        executor,
        source,
        WorkerPoolConfig::default().with_max_concurrency(config.max_concurrency),
    );

    tracing::info!(
        worker_id = %worker_pool.worker_id(),
        max_concurrency = config.max_concurrency,
        job_batch_size = config.job_batch_size,
        "Starting worker pool and job poller"
    );

    worker_pool.start().context("Failed to start worker pool")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let job_poller = JobPoller::new(
        store,
        producer,
        JobPollerConfig::default()
            .with_batch_size(config.job_batch_size)
            .with_poll_interval(config.job_poll_interval),
    );
    let job_handle = tokio::spawn(async move { job_poller.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = job_handle.await {
        tracing::error!(error = %e, "Job poller task failed");
    }

    if let Err(e) = worker_pool.shutdown().await {
        tracing::warn!(error = %e, "Worker pool did not drain cleanly");
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
