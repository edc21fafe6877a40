//! ProcessStore and StoreTransaction trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::model::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A status column held a value outside its enum
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    /// The transaction was already committed or rolled back
    #[error("transaction already closed")]
    TransactionClosed,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Durable store for process instances, steps and scheduled jobs
///
/// Every state-changing decision of the orchestration protocol runs inside a
/// [`StoreTransaction`]; the remaining methods are single-statement operations
/// and read helpers. Implementations must be thread-safe.
#[async_trait]
pub trait ProcessStore: Send + Sync + 'static {
    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    // =========================================================================
    // Scheduled Jobs
    // =========================================================================

    /// Queue a job to start a process later
    async fn schedule_job(&self, job: NewScheduledJob) -> Result<i64, StoreError>;

    /// Lease up to `limit` due NEW jobs, ordered by `scheduled_at`
    ///
    /// Selected rows transition to LOCKED in the same statement. Rows locked
    /// by a concurrent poller are skipped, so two pollers never lease the
    /// same job.
    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Mark a leased job DONE
    async fn complete_job(&self, job_id: i64) -> Result<(), StoreError>;

    // =========================================================================
    // Read helpers (no locks)
    // =========================================================================

    /// Get a process instance by id
    async fn get_instance(&self, process_id: i64) -> Result<Option<ProcessInstance>, StoreError>;

    /// Find a process instance by its idempotency key
    async fn find_instance(
        &self,
        process_type: &str,
        business_key: &str,
    ) -> Result<Option<ProcessInstance>, StoreError>;

    /// Get a single step
    async fn get_step(
        &self,
        process_id: i64,
        step_name: &str,
    ) -> Result<Option<ProcessStep>, StoreError>;

    /// List the steps of an instance in creation order
    async fn list_steps(&self, process_id: i64) -> Result<Vec<ProcessStep>, StoreError>;

    /// Get a scheduled job by id
    async fn get_job(&self, job_id: i64) -> Result<Option<ScheduledJob>, StoreError>;
}

/// An open store transaction
///
/// `lock_*` methods take row locks held until commit or rollback. Dropping a
/// transaction without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    // =========================================================================
    // Process Instances
    // =========================================================================

    /// Lock an instance by id
    async fn lock_instance(&mut self, process_id: i64)
        -> Result<Option<ProcessInstance>, StoreError>;

    /// Read an instance by id without locking it
    ///
    /// For callers that only need the immutable columns (`process_type`,
    /// `payload`), so sibling steps of one instance do not serialize on it.
    async fn read_instance(&mut self, process_id: i64)
        -> Result<Option<ProcessInstance>, StoreError>;

    /// Lock an instance by its (process_type, business_key) pair
    async fn lock_instance_by_key(
        &mut self,
        process_type: &str,
        business_key: &str,
    ) -> Result<Option<ProcessInstance>, StoreError>;

    /// Insert a RUNNING instance
    ///
    /// Returns `None` when an instance with the same non-null business key
    /// already exists (including one inserted by a concurrent, now committed,
    /// transaction).
    async fn insert_instance(
        &mut self,
        instance: &NewProcessInstance,
    ) -> Result<Option<i64>, StoreError>;

    /// Move an instance to a terminal status and stamp `finished_at`
    async fn finish_instance(
        &mut self,
        process_id: i64,
        status: ProcessStatus,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Process Steps
    // =========================================================================

    /// Lock a step by (process_id, step_name)
    async fn lock_step(
        &mut self,
        process_id: i64,
        step_name: &str,
    ) -> Result<Option<ProcessStep>, StoreError>;

    /// Insert a PENDING step, ignoring a duplicate (process_id, step_name)
    ///
    /// Returns `true` if a row was inserted.
    async fn insert_step(
        &mut self,
        process_id: i64,
        step_name: &str,
        join_group: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Lock every step of a join group, ordered by id
    async fn lock_join_group(
        &mut self,
        process_id: i64,
        join_group: &str,
    ) -> Result<Vec<ProcessStep>, StoreError>;

    /// Transition a locked step to RUNNING, bump `attempt`, stamp `locked_at`
    async fn claim_step(&mut self, step_id: i64) -> Result<ProcessStep, StoreError>;

    /// Transition a locked step to DONE
    async fn complete_step(&mut self, step_id: i64) -> Result<(), StoreError>;

    /// Transition a locked step to FAILED with an (already truncated) error
    async fn fail_step(&mut self, step_id: i64, error: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Commit the transaction
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Roll the transaction back
    async fn rollback(&mut self) -> Result<(), StoreError>;
}
