//! Process orchestrator
//!
//! The orchestrator owns every transactional transition of process and step
//! state: starting a process, creating successor steps, the join barrier and
//! terminal marking of steps. Each operation runs in one store transaction and
//! dispatches step tasks only after that transaction has committed, so a
//! consumer never receives a task whose step row is not yet visible.
//!
//! Dispatch is at-least-once. A crash between commit and dispatch leaves a
//! PENDING step without a task; duplicate dispatches are absorbed by the
//! executor's claim.

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::persistence::{
    NewProcessInstance, ProcessStatus, ProcessStore, StepStatus, StoreError, StoreTransaction,
};
use crate::queue::{QueueError, StepTask, TaskQueue};
use crate::util::truncate_chars;

use super::graph::INITIAL_STEP;

/// Default bound on the length of a stored step error, in characters
pub const DEFAULT_MAX_ERROR_LEN: usize = 4000;

/// Errors from orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("step not found: {process_id}/{step_name}")]
    StepNotFound { process_id: i64, step_name: String },

    #[error("process instance not found: {0}")]
    ProcessNotFound(i64),

    /// tryJoin was called for a group with no member steps
    #[error("join group '{join_group}' of process {process_id} has no steps")]
    EmptyJoinGroup { process_id: i64, join_group: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result of [`Orchestrator::start_process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new instance was created and its initial step dispatched
    Created(i64),

    /// An instance with the same business key already existed; nothing was dispatched
    Existing(i64),
}

impl StartOutcome {
    pub fn process_id(&self) -> i64 {
        match self {
            Self::Created(id) | Self::Existing(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Result of marking a step DONE or FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTransition {
    /// The status was written
    Applied,

    /// The step was already DONE; nothing changed
    AlreadyDone,

    /// The step was already FAILED; nothing changed
    AlreadyFailed,
}

/// Result of [`Orchestrator::try_join`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Not every member is DONE yet
    Pending { done: usize, total: usize },

    /// This caller created and dispatched the successor
    Released,

    /// Every member is DONE but the successor already existed
    AlreadyReleased,
}

/// Transactional process and step state transitions
pub struct Orchestrator {
    store: Arc<dyn ProcessStore>,
    queue: Arc<dyn TaskQueue>,
    max_error_len: usize,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ProcessStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            store,
            queue,
            max_error_len: DEFAULT_MAX_ERROR_LEN,
        }
    }

    /// Bound stored step errors to `max_error_len` characters
    pub fn with_max_error_len(mut self, max_error_len: usize) -> Self {
        self.max_error_len = max_error_len;
        self
    }

    pub fn store(&self) -> &Arc<dyn ProcessStore> {
        &self.store
    }

    /// Start a process, idempotently when `business_key` is given
    ///
    /// A new instance is created RUNNING together with its PENDING initial
    /// step, and the initial step is dispatched after commit. If an instance
    /// with the same `(process_type, business_key)` exists, or a concurrent
    /// caller creates it first, that instance is returned. Its initial step
    /// is dispatched again while still PENDING, so a start whose dispatch was
    /// lost can be repaired by retrying it.
    #[instrument(skip(self, payload))]
    pub async fn start_process(
        &self,
        process_type: &str,
        business_key: Option<&str>,
        payload: Value,
        source_job_id: Option<i64>,
    ) -> Result<StartOutcome, OrchestratorError> {
        let mut tx = self.store.begin().await?;

        if let Some(key) = business_key {
            if let Some(existing) = tx.lock_instance_by_key(process_type, key).await? {
                debug!(process_id = existing.id, "process already exists for business key");
                return self.resume_existing(tx, existing.id).await;
            }
        }

        let instance = NewProcessInstance {
            process_type: process_type.to_string(),
            business_key: business_key.map(str::to_string),
            payload,
            source_job_id,
        };

        let process_id = match (tx.insert_instance(&instance).await?, business_key) {
            (Some(id), _) => id,
            (None, Some(key)) => {
                // a concurrent start with the same key committed first
                let existing = tx.lock_instance_by_key(process_type, key).await?.ok_or_else(|| {
                    StoreError::Database(format!(
                        "instance {process_type}/{key} conflicted on insert but is not visible"
                    ))
                })?;
                debug!(process_id = existing.id, "lost start race for business key");
                return self.resume_existing(tx, existing.id).await;
            }
            (None, None) => {
                return Err(StoreError::Database(
                    "insert of instance without business key returned no id".to_string(),
                )
                .into());
            }
        };

        tx.insert_step(process_id, INITIAL_STEP, None).await?;
        tx.commit().await?;

        self.queue
            .dispatch(StepTask::new(process_id, INITIAL_STEP))
            .await?;

        info!(process_id, "process started");
        Ok(StartOutcome::Created(process_id))
    }

    /// Commit `tx` and re-dispatch the initial step if it never ran
    async fn resume_existing(
        &self,
        mut tx: Box<dyn StoreTransaction>,
        process_id: i64,
    ) -> Result<StartOutcome, OrchestratorError> {
        let pending = tx
            .lock_step(process_id, INITIAL_STEP)
            .await?
            .is_some_and(|step| step.status == StepStatus::Pending);
        tx.commit().await?;

        if pending {
            self.queue
                .dispatch(StepTask::new(process_id, INITIAL_STEP))
                .await?;
            debug!(process_id, "initial step still pending, dispatched again");
        }
        Ok(StartOutcome::Existing(process_id))
    }

    /// Create sibling steps in `join_group` and dispatch each of them
    ///
    /// Names that already exist for the instance are left untouched, but every
    /// name is dispatched again; the executor's claim absorbs duplicates.
    /// Returns how many steps were newly created.
    #[instrument(skip(self, step_names), fields(steps = step_names.len()))]
    pub async fn fan_out<S>(
        &self,
        process_id: i64,
        join_group: &str,
        step_names: &[S],
    ) -> Result<usize, OrchestratorError>
    where
        S: AsRef<str> + Sync,
    {
        if step_names.is_empty() {
            warn!("fan-out with no steps ignored");
            return Ok(0);
        }

        let mut tx = self.store.begin().await?;
        let mut created = 0;
        for name in step_names {
            if tx.insert_step(process_id, name.as_ref(), Some(join_group)).await? {
                created += 1;
            } else {
                debug!(step_name = name.as_ref(), "fan-out step already exists");
            }
        }
        tx.commit().await?;

        try_join_all(
            step_names
                .iter()
                .map(|name| self.queue.dispatch(StepTask::new(process_id, name.as_ref()))),
        )
        .await?;

        debug!(created, "fan-out dispatched");
        Ok(created)
    }

    /// Create and dispatch a single successor step outside any join group
    ///
    /// Returns whether the step row was newly created. The task is dispatched
    /// either way.
    #[instrument(skip(self))]
    pub async fn dispatch_successor(
        &self,
        process_id: i64,
        step_name: &str,
    ) -> Result<bool, OrchestratorError> {
        let mut tx = self.store.begin().await?;
        let created = tx.insert_step(process_id, step_name, None).await?;
        tx.commit().await?;

        if !created {
            debug!("successor step already exists");
        }
        self.queue
            .dispatch(StepTask::new(process_id, step_name))
            .await?;
        Ok(created)
    }

    /// Join barrier
    ///
    /// Locks every member of `join_group`. Once all are DONE, exactly one
    /// caller across all concurrent callers creates and dispatches
    /// `next_step`; the others observe [`JoinOutcome::AlreadyReleased`].
    #[instrument(skip(self))]
    pub async fn try_join(
        &self,
        process_id: i64,
        join_group: &str,
        next_step: &str,
    ) -> Result<JoinOutcome, OrchestratorError> {
        let mut tx = self.store.begin().await?;

        let members = tx.lock_join_group(process_id, join_group).await?;
        if members.is_empty() {
            tx.rollback().await?;
            return Err(OrchestratorError::EmptyJoinGroup {
                process_id,
                join_group: join_group.to_string(),
            });
        }

        let total = members.len();
        let done = members
            .iter()
            .filter(|step| step.status == StepStatus::Done)
            .count();
        if done < total {
            tx.commit().await?;
            debug!(done, total, "join barrier not yet satisfied");
            return Ok(JoinOutcome::Pending { done, total });
        }

        if tx.lock_step(process_id, next_step).await?.is_some() {
            tx.commit().await?;
            debug!("join successor already released");
            return Ok(JoinOutcome::AlreadyReleased);
        }

        let created = tx.insert_step(process_id, next_step, None).await?;
        tx.commit().await?;
        if !created {
            debug!("join successor created concurrently");
            return Ok(JoinOutcome::AlreadyReleased);
        }

        self.queue
            .dispatch(StepTask::new(process_id, next_step))
            .await?;

        info!(total, "join barrier released successor");
        Ok(JoinOutcome::Released)
    }

    /// Mark a step DONE
    ///
    /// Terminal steps are left as they are.
    #[instrument(skip(self))]
    pub async fn mark_step_done(
        &self,
        process_id: i64,
        step_name: &str,
    ) -> Result<StepTransition, OrchestratorError> {
        let mut tx = self.store.begin().await?;

        let Some(step) = tx.lock_step(process_id, step_name).await? else {
            tx.rollback().await?;
            return Err(OrchestratorError::StepNotFound {
                process_id,
                step_name: step_name.to_string(),
            });
        };

        let transition = match step.status {
            StepStatus::Done => StepTransition::AlreadyDone,
            StepStatus::Failed => {
                warn!("step already failed, not marking done");
                StepTransition::AlreadyFailed
            }
            StepStatus::Pending | StepStatus::Running => {
                tx.complete_step(step.id).await?;
                StepTransition::Applied
            }
        };
        tx.commit().await?;

        debug!(?transition, "mark step done");
        Ok(transition)
    }

    /// Mark a step FAILED and fail its process instance
    ///
    /// A DONE step is never overwritten. The error is truncated to the
    /// configured bound; a RUNNING instance moves to FAILED in the same
    /// transaction.
    #[instrument(skip(self, error))]
    pub async fn mark_step_failed(
        &self,
        process_id: i64,
        step_name: &str,
        error: &str,
    ) -> Result<StepTransition, OrchestratorError> {
        let mut tx = self.store.begin().await?;

        let Some(step) = tx.lock_step(process_id, step_name).await? else {
            tx.rollback().await?;
            return Err(OrchestratorError::StepNotFound {
                process_id,
                step_name: step_name.to_string(),
            });
        };

        if step.status == StepStatus::Done {
            tx.commit().await?;
            debug!("step already done, ignoring failure");
            return Ok(StepTransition::AlreadyDone);
        }

        tx.fail_step(step.id, truncate_chars(error, self.max_error_len))
            .await?;

        if let Some(instance) = tx.lock_instance(process_id).await? {
            if instance.status == ProcessStatus::Running {
                tx.finish_instance(process_id, ProcessStatus::Failed).await?;
            }
        }
        tx.commit().await?;

        warn!(error, "step failed");
        Ok(StepTransition::Applied)
    }

    /// Mark a RUNNING process COMPLETED
    ///
    /// Returns `false` if the instance was already terminal.
    #[instrument(skip(self))]
    pub async fn complete_process(&self, process_id: i64) -> Result<bool, OrchestratorError> {
        let mut tx = self.store.begin().await?;

        let Some(instance) = tx.lock_instance(process_id).await? else {
            tx.rollback().await?;
            return Err(OrchestratorError::ProcessNotFound(process_id));
        };

        if instance.status != ProcessStatus::Running {
            tx.commit().await?;
            debug!(status = %instance.status, "process already terminal");
            return Ok(false);
        }

        tx.finish_instance(process_id, ProcessStatus::Completed)
            .await?;
        tx.commit().await?;

        info!("process completed");
        Ok(true)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("max_error_len", &self.max_error_len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryProcessStore;
    use crate::queue::InMemoryTaskQueue;
    use serde_json::json;

    struct Harness {
        store: InMemoryProcessStore,
        queue: Arc<InMemoryTaskQueue>,
        orchestrator: Orchestrator,
    }

    fn harness() -> Harness {
        let store = InMemoryProcessStore::new();
        let queue = Arc::new(InMemoryTaskQueue::new());
        let orchestrator = Orchestrator::new(Arc::new(store.clone()), queue.clone());
        Harness {
            store,
            queue,
            orchestrator,
        }
    }

    async fn claim(store: &InMemoryProcessStore, process_id: i64, step_name: &str) {
        let mut tx = store.begin().await.unwrap();
        let step = tx.lock_step(process_id, step_name).await.unwrap().unwrap();
        tx.claim_step(step.id).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_process_creates_instance_and_initial_step() {
        let h = harness();

        let outcome = h
            .orchestrator
            .start_process("order", Some("ORD-1"), json!({"amount": 10}), None)
            .await
            .unwrap();

        assert!(outcome.is_created());
        let pid = outcome.process_id();

        let instance = h.store.get_instance(pid).await.unwrap().unwrap();
        assert_eq!(instance.status, ProcessStatus::Running);
        assert_eq!(instance.business_key.as_deref(), Some("ORD-1"));
        assert_eq!(instance.payload, json!({"amount": 10}));

        let steps = h.store.list_steps(pid).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_name, "prepare");
        assert_eq!(steps[0].status, StepStatus::Pending);
        assert_eq!(h.queue.dispatched(), vec![StepTask::new(pid, "prepare")]);
    }

    #[tokio::test]
    async fn test_start_process_is_idempotent_by_business_key() {
        let h = harness();

        let first = h
            .orchestrator
            .start_process("order", Some("ORD-1"), json!({}), None)
            .await
            .unwrap();
        let second = h
            .orchestrator
            .start_process("order", Some("ORD-1"), json!({"other": true}), None)
            .await
            .unwrap();

        assert_eq!(second, StartOutcome::Existing(first.process_id()));
        assert_eq!(h.store.instance_count().await, 1);
        // prepare never ran, so the retry re-sends it
        assert_eq!(h.queue.dispatch_count(first.process_id(), "prepare"), 2);

        claim(&h.store, first.process_id(), "prepare").await;
        let third = h
            .orchestrator
            .start_process("order", Some("ORD-1"), json!({}), None)
            .await
            .unwrap();
        assert_eq!(third, StartOutcome::Existing(first.process_id()));
        assert_eq!(h.queue.dispatch_count(first.process_id(), "prepare"), 2);
    }

    #[tokio::test]
    async fn test_restart_after_prepare_done_dispatches_nothing() {
        let h = harness();
        let pid = h
            .orchestrator
            .start_process("order", Some("ORD-1"), json!({}), None)
            .await
            .unwrap()
            .process_id();
        claim(&h.store, pid, "prepare").await;
        h.orchestrator.mark_step_done(pid, "prepare").await.unwrap();

        let again = h
            .orchestrator
            .start_process("order", Some("ORD-1"), json!({}), None)
            .await
            .unwrap();
        assert_eq!(again, StartOutcome::Existing(pid));
        assert_eq!(h.queue.dispatch_count(pid, "prepare"), 1);
    }

    #[tokio::test]
    async fn test_start_process_without_key_always_creates() {
        let h = harness();

        let a = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap();
        let b = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap();

        assert!(a.is_created() && b.is_created());
        assert_ne!(a.process_id(), b.process_id());
    }

    #[tokio::test]
    async fn test_same_key_different_type_is_distinct() {
        let h = harness();

        let a = h.orchestrator.start_process("order", Some("K"), json!({}), None).await.unwrap();
        let b = h.orchestrator.start_process("refund", Some("K"), json!({}), None).await.unwrap();

        assert!(b.is_created());
        assert_ne!(a.process_id(), b.process_id());
    }

    #[tokio::test]
    async fn test_fan_out_ignores_existing_steps_but_redispatches() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();

        let created = h.orchestrator.fan_out(pid, "calls", &["a", "b"]).await.unwrap();
        assert_eq!(created, 2);

        let created = h.orchestrator.fan_out(pid, "calls", &["a", "b", "c"]).await.unwrap();
        assert_eq!(created, 1);

        assert_eq!(h.queue.dispatch_count(pid, "a"), 2);
        assert_eq!(h.queue.dispatch_count(pid, "c"), 1);

        let c = h.store.get_step(pid, "c").await.unwrap().unwrap();
        assert_eq!(c.join_group.as_deref(), Some("calls"));
        assert_eq!(c.status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_fan_out_with_no_steps_is_noop() {
        let h = harness();
        let created = h.orchestrator.fan_out::<&str>(1, "calls", &[]).await.unwrap();
        assert_eq!(created, 0);
        assert!(h.queue.dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_try_join_waits_for_all_members() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();
        h.orchestrator.fan_out(pid, "calls", &["a", "b", "c"]).await.unwrap();

        h.orchestrator.mark_step_done(pid, "a").await.unwrap();
        h.orchestrator.mark_step_done(pid, "b").await.unwrap();

        let outcome = h.orchestrator.try_join(pid, "calls", "finalize").await.unwrap();
        assert_eq!(outcome, JoinOutcome::Pending { done: 2, total: 3 });
        assert!(h.store.get_step(pid, "finalize").await.unwrap().is_none());

        h.orchestrator.mark_step_done(pid, "c").await.unwrap();
        let outcome = h.orchestrator.try_join(pid, "calls", "finalize").await.unwrap();
        assert_eq!(outcome, JoinOutcome::Released);

        let outcome = h.orchestrator.try_join(pid, "calls", "finalize").await.unwrap();
        assert_eq!(outcome, JoinOutcome::AlreadyReleased);

        assert_eq!(h.queue.dispatch_count(pid, "finalize"), 1);
        let finalize = h.store.get_step(pid, "finalize").await.unwrap().unwrap();
        assert_eq!(finalize.status, StepStatus::Pending);
        assert!(finalize.join_group.is_none());
    }

    #[tokio::test]
    async fn test_try_join_failed_member_never_releases() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();
        h.orchestrator.fan_out(pid, "calls", &["a", "b"]).await.unwrap();

        h.orchestrator.mark_step_done(pid, "a").await.unwrap();
        h.orchestrator.mark_step_failed(pid, "b", "boom").await.unwrap();

        let outcome = h.orchestrator.try_join(pid, "calls", "finalize").await.unwrap();
        assert_eq!(outcome, JoinOutcome::Pending { done: 1, total: 2 });
    }

    #[tokio::test]
    async fn test_try_join_empty_group_is_error() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();

        let err = h.orchestrator.try_join(pid, "nothing", "finalize").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyJoinGroup { .. }));
        assert!(h.store.get_step(pid, "finalize").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_step_done_is_idempotent() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();
        claim(&h.store, pid, "prepare").await;

        assert_eq!(
            h.orchestrator.mark_step_done(pid, "prepare").await.unwrap(),
            StepTransition::Applied
        );
        let first = h.store.get_step(pid, "prepare").await.unwrap().unwrap();

        assert_eq!(
            h.orchestrator.mark_step_done(pid, "prepare").await.unwrap(),
            StepTransition::AlreadyDone
        );
        let second = h.store.get_step(pid, "prepare").await.unwrap().unwrap();

        assert_eq!(second.status, StepStatus::Done);
        assert_eq!(first.finished_at, second.finished_at);
    }

    #[tokio::test]
    async fn test_mark_step_done_unknown_step() {
        let h = harness();
        let err = h.orchestrator.mark_step_done(99, "prepare").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StepNotFound { process_id: 99, .. }));
    }

    #[tokio::test]
    async fn test_mark_step_done_keeps_failed_step() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();
        h.orchestrator.mark_step_failed(pid, "prepare", "boom").await.unwrap();

        assert_eq!(
            h.orchestrator.mark_step_done(pid, "prepare").await.unwrap(),
            StepTransition::AlreadyFailed
        );
        let step = h.store.get_step(pid, "prepare").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_mark_step_failed_fails_instance_and_truncates() {
        let h = harness();
        let orchestrator = Orchestrator::new(Arc::new(h.store.clone()), h.queue.clone())
            .with_max_error_len(5);
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();
        claim(&h.store, pid, "prepare").await;

        let transition = orchestrator
            .mark_step_failed(pid, "prepare", "connection refused")
            .await
            .unwrap();
        assert_eq!(transition, StepTransition::Applied);

        let step = h.store.get_step(pid, "prepare").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.last_error.as_deref(), Some("conne"));
        assert!(step.finished_at.is_some());

        let instance = h.store.get_instance(pid).await.unwrap().unwrap();
        assert_eq!(instance.status, ProcessStatus::Failed);
        assert!(instance.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_step_failed_never_overrides_done() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();
        h.orchestrator.mark_step_done(pid, "prepare").await.unwrap();

        let transition = h
            .orchestrator
            .mark_step_failed(pid, "prepare", "late failure")
            .await
            .unwrap();
        assert_eq!(transition, StepTransition::AlreadyDone);

        let step = h.store.get_step(pid, "prepare").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Done);
        assert!(step.last_error.is_none());

        let instance = h.store.get_instance(pid).await.unwrap().unwrap();
        assert_eq!(instance.status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_mark_step_failed_overwrites_previous_error() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();

        h.orchestrator.mark_step_failed(pid, "prepare", "first").await.unwrap();
        h.orchestrator.mark_step_failed(pid, "prepare", "second").await.unwrap();

        let step = h.store.get_step(pid, "prepare").await.unwrap().unwrap();
        assert_eq!(step.last_error.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_complete_process() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();

        assert!(h.orchestrator.complete_process(pid).await.unwrap());
        assert!(!h.orchestrator.complete_process(pid).await.unwrap());

        let instance = h.store.get_instance(pid).await.unwrap().unwrap();
        assert_eq!(instance.status, ProcessStatus::Completed);

        let err = h.orchestrator.complete_process(pid + 100).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ProcessNotFound(_)));
    }

    #[tokio::test]
    async fn test_complete_process_keeps_failed_instance() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();
        h.orchestrator.mark_step_failed(pid, "prepare", "boom").await.unwrap();

        assert!(!h.orchestrator.complete_process(pid).await.unwrap());
        let instance = h.store.get_instance(pid).await.unwrap().unwrap();
        assert_eq!(instance.status, ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn test_dispatch_successor() {
        let h = harness();
        let pid = h.orchestrator.start_process("order", None, json!({}), None).await.unwrap().process_id();

        assert!(h.orchestrator.dispatch_successor(pid, "dispatch").await.unwrap());
        assert!(!h.orchestrator.dispatch_successor(pid, "dispatch").await.unwrap());
        assert_eq!(h.queue.dispatch_count(pid, "dispatch"), 2);
        assert_eq!(h.store.list_steps(pid).await.unwrap().len(), 2);
    }
}
