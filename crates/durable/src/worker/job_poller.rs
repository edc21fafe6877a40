//! Scheduled-job poller
//!
//! Leases due jobs (NEW -> LOCKED, skipping rows held by concurrent pollers),
//! starts one process per job and marks the job DONE. A job whose process
//! could not be started stays LOCKED.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::engine::{Orchestrator, OrchestratorError, StartOutcome};
use crate::persistence::{ProcessStore, ScheduledJob, StoreError};
use crate::queue::TaskQueue;
use crate::util::duration_millis;

/// Job poller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobPollerConfig {
    /// Maximum jobs leased per poll
    pub batch_size: usize,

    /// Pause between polls that found less than a full batch
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for JobPollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl JobPollerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Jobs leased
    pub claimed: usize,

    /// Jobs whose process was started (or already existed) and that are now DONE
    pub started: usize,

    /// Jobs left LOCKED because starting their process failed
    pub failed: usize,
}

/// Job poller errors
#[derive(Debug, thiserror::Error)]
pub enum JobPollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Polls `scheduled_jobs` and starts their processes
pub struct JobPoller {
    store: Arc<dyn ProcessStore>,
    orchestrator: Orchestrator,
    config: JobPollerConfig,
}

impl JobPoller {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        queue: Arc<dyn TaskQueue>,
        config: JobPollerConfig,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(Arc::clone(&store), queue),
            store,
            config,
        }
    }

    pub fn config(&self) -> &JobPollerConfig {
        &self.config
    }

    /// Lease and process one batch of jobs due at `now`
    ///
    /// Failures to start individual jobs are logged and counted; only a
    /// failure to lease the batch is returned as an error.
    #[instrument(skip(self))]
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport, JobPollerError> {
        let jobs = self
            .store
            .claim_due_jobs(now, self.batch_size())
            .await?;

        let mut report = PollReport {
            claimed: jobs.len(),
            ..Default::default()
        };

        for job in &jobs {
            match self.start_job(job).await {
                Ok(outcome) => {
                    debug!(job_id = job.id, ?outcome, "scheduled job processed");
                    report.started += 1;
                }
                Err(e) => {
                    error!(job_id = job.id, "failed to start process for scheduled job: {}", e);
                    report.failed += 1;
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                started = report.started,
                failed = report.failed,
                "processed scheduled jobs"
            );
        }
        Ok(report)
    }

    async fn start_job(&self, job: &ScheduledJob) -> Result<StartOutcome, JobPollerError> {
        let outcome = self
            .orchestrator
            .start_process(
                &job.process_type,
                job.business_key.as_deref(),
                job.payload.clone(),
                Some(job.id),
            )
            .await?;
        self.store.complete_job(job.id).await?;
        Ok(outcome)
    }

    /// Jobs leased per poll; a zero from config or serde counts as one
    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Poll until shutdown is signalled
    ///
    /// A full batch is followed immediately by another poll; otherwise the
    /// poller sleeps for `poll_interval`.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            batch_size = self.batch_size(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting job poller"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let full_batch = match self.poll_once(Utc::now()).await {
                Ok(report) => report.claimed >= self.batch_size(),
                Err(e) => {
                    error!("job poll failed: {}", e);
                    false
                }
            };
            if full_batch {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("job poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryProcessStore, JobStatus, NewScheduledJob};
    use crate::queue::{InMemoryTaskQueue, QueueError, StepTask};
    use async_trait::async_trait;
    use serde_json::json;

    struct ClosedQueue;

    #[async_trait]
    impl TaskQueue for ClosedQueue {
        async fn dispatch(&self, _task: StepTask) -> Result<(), QueueError> {
            Err(QueueError::Closed)
        }
    }

    fn poller(store: &InMemoryProcessStore, queue: Arc<dyn TaskQueue>) -> JobPoller {
        JobPoller::new(
            Arc::new(store.clone()),
            queue,
            JobPollerConfig::default().with_batch_size(2),
        )
    }

    #[tokio::test]
    async fn test_poll_once_starts_due_jobs() {
        let store = InMemoryProcessStore::new();
        let queue = Arc::new(InMemoryTaskQueue::new());
        let poller = poller(&store, queue.clone());

        let job_id = store
            .schedule_job(NewScheduledJob::now("order", Some("ORD-1".into()), json!({"amount": 10})))
            .await
            .unwrap();

        let report = poller.poll_once(Utc::now()).await.unwrap();
        assert_eq!(report, PollReport { claimed: 1, started: 1, failed: 0 });

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);

        let instance = store.find_instance("order", "ORD-1").await.unwrap().unwrap();
        assert_eq!(instance.source_job_id, Some(job_id));
        assert_eq!(instance.payload, json!({"amount": 10}));
        assert_eq!(queue.dispatch_count(instance.id, "prepare"), 1);
    }

    #[tokio::test]
    async fn test_future_jobs_are_not_claimed() {
        let store = InMemoryProcessStore::new();
        let poller = poller(&store, Arc::new(InMemoryTaskQueue::new()));

        let later = Utc::now() + chrono::Duration::hours(1);
        let job_id = store
            .schedule_job(NewScheduledJob::now("order", None, json!({})).at(later))
            .await
            .unwrap();

        let report = poller.poll_once(Utc::now()).await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(store.get_job(job_id).await.unwrap().unwrap().status, JobStatus::New);
    }

    #[tokio::test]
    async fn test_batch_size_limits_claim() {
        let store = InMemoryProcessStore::new();
        let poller = poller(&store, Arc::new(InMemoryTaskQueue::new()));
        for key in ["A", "B", "C"] {
            store
                .schedule_job(NewScheduledJob::now("order", Some(key.into()), json!({})))
                .await
                .unwrap();
        }

        assert_eq!(poller.poll_once(Utc::now()).await.unwrap().claimed, 2);
        assert_eq!(poller.poll_once(Utc::now()).await.unwrap().claimed, 1);
        assert_eq!(poller.poll_once(Utc::now()).await.unwrap().claimed, 0);
        assert_eq!(store.instance_count().await, 3);
    }

    #[tokio::test]
    async fn test_duplicate_business_key_jobs_start_one_process() {
        let store = InMemoryProcessStore::new();
        let queue = Arc::new(InMemoryTaskQueue::new());
        let poller = poller(&store, queue.clone());

        let first = store
            .schedule_job(NewScheduledJob::now("order", Some("ORD-1".into()), json!({})))
            .await
            .unwrap();
        let second = store
            .schedule_job(NewScheduledJob::now("order", Some("ORD-1".into()), json!({})))
            .await
            .unwrap();

        let report = poller.poll_once(Utc::now()).await.unwrap();
        assert_eq!(report.started, 2);
        assert_eq!(store.instance_count().await, 1);
        let instance = store.find_instance("order", "ORD-1").await.unwrap().unwrap();
        assert_eq!(instance.source_job_id, Some(first));
        // the second job re-sends the still pending initial step
        assert_eq!(queue.dispatch_count(instance.id, "prepare"), 2);
        assert_eq!(store.get_job(first).await.unwrap().unwrap().status, JobStatus::Done);
        assert_eq!(store.get_job(second).await.unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_job_locked() {
        let store = InMemoryProcessStore::new();
        let poller = poller(&store, Arc::new(ClosedQueue));

        let job_id = store
            .schedule_job(NewScheduledJob::now("order", Some("ORD-1".into()), json!({})))
            .await
            .unwrap();

        let report = poller.poll_once(Utc::now()).await.unwrap();
        assert_eq!(report, PollReport { claimed: 1, started: 0, failed: 1 });
        assert_eq!(store.get_job(job_id).await.unwrap().unwrap().status, JobStatus::Locked);

        // a LOCKED job is not leased again
        assert_eq!(poller.poll_once(Utc::now()).await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn test_zero_batch_size_still_claims_one_job() {
        let store = InMemoryProcessStore::new();
        let config = JobPollerConfig {
            batch_size: 0,
            ..JobPollerConfig::default()
        };
        let poller = JobPoller::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryTaskQueue::new()),
            config,
        );
        for key in ["A", "B"] {
            store
                .schedule_job(NewScheduledJob::now("order", Some(key.into()), json!({})))
                .await
                .unwrap();
        }

        assert_eq!(poller.poll_once(Utc::now()).await.unwrap().claimed, 1);
        assert_eq!(poller.poll_once(Utc::now()).await.unwrap().claimed, 1);
        assert_eq!(poller.poll_once(Utc::now()).await.unwrap().claimed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_batch_size_run_sleeps_when_idle() {
        let store = InMemoryProcessStore::new();
        let poller = Arc::new(JobPoller::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryTaskQueue::new()),
            JobPollerConfig {
                batch_size: 0,
                poll_interval: Duration::from_secs(60),
            },
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.run(shutdown_rx).await })
        };

        // An idle poller parks in its sleep, letting this task run again
        tokio::time::sleep(Duration::from_secs(1)).await;
        let job_id = store
            .schedule_job(NewScheduledJob::now("order", None, json!({})))
            .await
            .unwrap();
        assert_eq!(store.get_job(job_id).await.unwrap().unwrap().status, JobStatus::New);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.get_job(job_id).await.unwrap().unwrap().status, JobStatus::Done);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let store = InMemoryProcessStore::new();
        let poller = Arc::new(JobPoller::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryTaskQueue::new()),
            JobPollerConfig::default().with_poll_interval(Duration::from_millis(5)),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.run(shutdown_rx).await })
        };

        let job_id = store
            .schedule_job(NewScheduledJob::now("order", None, json!({})))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = store.get_job(job_id).await.unwrap().unwrap();
                if job.status == JobStatus::Done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job was not processed");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
    }
}
