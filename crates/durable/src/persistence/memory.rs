//! In-memory implementation of ProcessStore for testing

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::model::*;
use super::store::*;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    instances: BTreeMap<i64, ProcessInstance>,
    steps: BTreeMap<i64, ProcessStep>,
    jobs: BTreeMap<i64, ScheduledJob>,
    last_instance_id: i64,
    last_step_id: i64,
    last_job_id: i64,
}

impl MemoryState {
    fn step_by_name(&self, process_id: i64, step_name: &str) -> Option<&ProcessStep> {
        self.steps
            .values()
            .find(|s| s.process_instance_id == process_id && s.step_name == step_name)
    }

    fn instance_by_key(&self, process_type: &str, business_key: &str) -> Option<&ProcessInstance> {
        self.instances.values().find(|i| {
            i.process_type == process_type && i.business_key.as_deref() == Some(business_key)
        })
    }

    fn step_mut(&mut self, step_id: i64) -> Result<&mut ProcessStep, StoreError> {
        self.steps
            .get_mut(&step_id)
            .ok_or_else(|| StoreError::Database(format!("step row {} does not exist", step_id)))
    }
}

/// In-memory implementation of ProcessStore
///
/// Provides the same observable semantics as the PostgreSQL store. A
/// transaction holds an exclusive lock over the whole state until it commits
/// or rolls back, which is strictly stronger isolation than row locking, and
/// restores a snapshot if it ends without committing.
///
/// # Example
///
/// ```
/// use procflow_durable::InMemoryProcessStore;
///
/// let store = InMemoryProcessStore::new();
/// ```
#[derive(Clone, Default)]
pub struct InMemoryProcessStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryProcessStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of process instances
    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    /// Get the number of steps across all instances
    pub async fn step_count(&self) -> usize {
        self.state.lock().await.steps.len()
    }

    /// Clear all data (for testing)
    pub async fn clear(&self) {
        *self.state.lock().await = MemoryState::default();
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard: Some(guard),
            snapshot: Some(snapshot),
        }))
    }

    async fn schedule_job(&self, job: NewScheduledJob) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        state.last_job_id += 1;
        let id = state.last_job_id;
        state.jobs.insert(
            id,
            ScheduledJob {
                id,
                process_type: job.process_type,
                business_key: job.business_key,
                payload: job.payload,
                status: JobStatus::New,
                scheduled_at: job.scheduled_at,
            },
        );
        Ok(id)
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut state = self.state.lock().await;

        let mut due: Vec<(DateTime<Utc>, i64)> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::New && j.scheduled_at <= now)
            .map(|j| (j.scheduled_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Locked;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Locked {
                job.status = JobStatus::Done;
            }
        }
        Ok(())
    }

    async fn get_instance(&self, process_id: i64) -> Result<Option<ProcessInstance>, StoreError> {
        Ok(self.state.lock().await.instances.get(&process_id).cloned())
    }

    async fn find_instance(
        &self,
        process_type: &str,
        business_key: &str,
    ) -> Result<Option<ProcessInstance>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .instance_by_key(process_type, business_key)
            .cloned())
    }

    async fn get_step(
        &self,
        process_id: i64,
        step_name: &str,
    ) -> Result<Option<ProcessStep>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .step_by_name(process_id, step_name)
            .cloned())
    }

    async fn list_steps(&self, process_id: i64) -> Result<Vec<ProcessStep>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .steps
            .values()
            .filter(|s| s.process_instance_id == process_id)
            .cloned()
            .collect())
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }
}

/// An open in-memory transaction
pub struct InMemoryTransaction {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    snapshot: Option<MemoryState>,
}

impl InMemoryTransaction {
    fn state(&mut self) -> Result<&mut MemoryState, StoreError> {
        self.guard
            .as_deref_mut()
            .ok_or(StoreError::TransactionClosed)
    }

    fn restore(&mut self) {
        if let (Some(guard), Some(snapshot)) = (self.guard.as_mut(), self.snapshot.take()) {
            **guard = snapshot;
        }
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.restore();
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn lock_instance(
        &mut self,
        process_id: i64,
    ) -> Result<Option<ProcessInstance>, StoreError> {
        Ok(self.state()?.instances.get(&process_id).cloned())
    }

    async fn read_instance(
        &mut self,
        process_id: i64,
    ) -> Result<Option<ProcessInstance>, StoreError> {
        self.lock_instance(process_id).await
    }

    async fn lock_instance_by_key(
        &mut self,
        process_type: &str,
        business_key: &str,
    ) -> Result<Option<ProcessInstance>, StoreError> {
        Ok(self
            .state()?
            .instance_by_key(process_type, business_key)
            .cloned())
    }

    async fn insert_instance(
        &mut self,
        instance: &NewProcessInstance,
    ) -> Result<Option<i64>, StoreError> {
        let state = self.state()?;

        if let Some(key) = instance.business_key.as_deref() {
            if state.instance_by_key(&instance.process_type, key).is_some() {
                return Ok(None);
            }
        }

        state.last_instance_id += 1;
        let id = state.last_instance_id;
        state.instances.insert(
            id,
            ProcessInstance {
                id,
                process_type: instance.process_type.clone(),
                business_key: instance.business_key.clone(),
                status: ProcessStatus::Running,
                payload: instance.payload.clone(),
                source_job_id: instance.source_job_id,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
        Ok(Some(id))
    }

    async fn finish_instance(
        &mut self,
        process_id: i64,
        status: ProcessStatus,
    ) -> Result<(), StoreError> {
        if let Some(instance) = self.state()?.instances.get_mut(&process_id) {
            instance.status = status;
            instance.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn lock_step(
        &mut self,
        process_id: i64,
        step_name: &str,
    ) -> Result<Option<ProcessStep>, StoreError> {
        Ok(self.state()?.step_by_name(process_id, step_name).cloned())
    }

    async fn insert_step(
        &mut self,
        process_id: i64,
        step_name: &str,
        join_group: Option<&str>,
    ) -> Result<bool, StoreError> {
        let state = self.state()?;
        if state.step_by_name(process_id, step_name).is_some() {
            return Ok(false);
        }

        state.last_step_id += 1;
        let id = state.last_step_id;
        state.steps.insert(
            id,
            ProcessStep {
                id,
                process_instance_id: process_id,
                step_name: step_name.to_string(),
                status: StepStatus::Pending,
                attempt: 0,
                join_group: join_group.map(str::to_string),
                last_error: None,
                locked_at: None,
                updated_at: Utc::now(),
                finished_at: None,
            },
        );
        Ok(true)
    }

    async fn lock_join_group(
        &mut self,
        process_id: i64,
        join_group: &str,
    ) -> Result<Vec<ProcessStep>, StoreError> {
        Ok(self
            .state()?
            .steps
            .values()
            .filter(|s| {
                s.process_instance_id == process_id && s.join_group.as_deref() == Some(join_group)
            })
            .cloned()
            .collect())
    }

    async fn claim_step(&mut self, step_id: i64) -> Result<ProcessStep, StoreError> {
        let step = self.state()?.step_mut(step_id)?;
        let now = Utc::now();
        step.status = StepStatus::Running;
        step.attempt += 1;
        step.locked_at = Some(now);
        step.updated_at = now;
        Ok(step.clone())
    }

    async fn complete_step(&mut self, step_id: i64) -> Result<(), StoreError> {
        let step = self.state()?.step_mut(step_id)?;
        let now = Utc::now();
        step.status = StepStatus::Done;
        step.finished_at = Some(now);
        step.updated_at = now;
        Ok(())
    }

    async fn fail_step(&mut self, step_id: i64, error: &str) -> Result<(), StoreError> {
        let step = self.state()?.step_mut(step_id)?;
        let now = Utc::now();
        step.status = StepStatus::Failed;
        step.last_error = Some(error.to_string());
        step.finished_at = Some(now);
        step.updated_at = now;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.guard.is_none() {
            return Err(StoreError::TransactionClosed);
        }
        self.snapshot = None;
        self.guard = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.guard.is_none() {
            return Err(StoreError::TransactionClosed);
        }
        self.restore();
        self.guard = None;
        Ok(())
    }
}
