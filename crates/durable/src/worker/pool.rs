//! Worker pool for step execution
//!
//! Feeds deliveries from a [`TaskSource`] to the [`StepExecutor`] with
//! bounded concurrency and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, TaskPoller};
use crate::engine::StepExecutor;
use crate::queue::{Delivery, NackOutcome, TaskSource};
use crate::util::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Consumer id reported to the task source (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent step executions
    pub max_concurrency: usize,

    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Polling and executing steps
    Running,
    /// Finishing in-flight steps, not receiving new ones
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out with {0} step(s) in flight")]
    ShutdownTimeout(usize),
}

/// Worker pool executing step tasks
///
/// # Example
///
/// ```ignore
/// use procflow_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let config = WorkerPoolConfig::new()
///     .with_worker_id("order-worker-1")
///     .with_max_concurrency(20);
///
/// let pool = WorkerPool::new(executor, queue, config);
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    executor: Arc<StepExecutor>,
    source: Arc<dyn TaskSource>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        executor: Arc<StepExecutor>,
        source: Arc<dyn TaskSource>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            executor,
            source,
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            poll_handle: Mutex::new(None),
        }
    }

    /// Start polling in the background
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        self.start_poll_loop();
        Ok(())
    }

    /// Stop polling and wait for in-flight steps to finish
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let handle = self.poll_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("poll loop panicked: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                debug!("all steps completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight, "shutdown timeout reached");
                return Err(WorkerPoolError::ShutdownTimeout(in_flight));
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of steps currently executing
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn start_poll_loop(&self) {
        let executor = Arc::clone(&self.executor);
        let source = Arc::clone(&self.source);
        let active_tasks = Arc::clone(&self.active_tasks);
        let mut poller = TaskPoller::new(
            Arc::clone(&self.source),
            self.config.worker_id.clone(),
            self.config.poller.clone(),
            self.shutdown_rx.clone(),
        );

        let handle = tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                let available = active_tasks.available_permits();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available).await {
                    Ok(deliveries) => {
                        for delivery in deliveries {
                            let Ok(permit) = Arc::clone(&active_tasks).acquire_owned().await
                            else {
                                break;
                            };

                            tokio::spawn(handle_delivery(
                                Arc::clone(&executor),
                                Arc::clone(&source),
                                delivery,
                                permit,
                            ));
                        }
                    }
                    Err(e) => {
                        error!("poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}

/// Execute one delivery and settle it with the source
async fn handle_delivery(
    executor: Arc<StepExecutor>,
    source: Arc<dyn TaskSource>,
    delivery: Delivery,
    _permit: OwnedSemaphorePermit,
) {
    match executor.execute(&delivery.task).await {
        Ok(outcome) => {
            debug!(task = %delivery.task, ?outcome, "step task handled");
            if let Err(e) = source.ack(&delivery).await {
                error!(task = %delivery.task, "failed to ack step task: {}", e);
            }
        }
        Err(err) => {
            warn!(
                task = %delivery.task,
                attempt = delivery.attempt,
                retryable = err.is_retryable(),
                "step task failed: {}",
                err
            );
            match source.nack(&delivery, &err.to_string()).await {
                Ok(NackOutcome::Retry { delay, .. }) => {
                    debug!(task = %delivery.task, delay_ms = delay.as_millis() as u64, "step task will be redelivered");
                }
                Ok(NackOutcome::Dead) => {
                    warn!(task = %delivery.task, "step task dead-lettered");
                }
                Err(e) => {
                    error!(task = %delivery.task, "failed to nack step task: {}", e);
                }
            }
        }
    }
}
