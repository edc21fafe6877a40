//! PostgreSQL implementation of ProcessStore
//!
//! Production persistence using PostgreSQL with:
//! - Pessimistic row locks (`SELECT ... FOR UPDATE`) inside short transactions
//! - Idempotent inserts via `ON CONFLICT DO NOTHING` on the unique keys
//! - Job leasing with `FOR UPDATE SKIP LOCKED`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};

use super::model::*;
use super::store::*;

const INSTANCE_COLUMNS: &str =
    "id, process_type, business_key, status, payload, source_job_id, started_at, finished_at";

const STEP_COLUMNS: &str = "id, process_instance_id, step_name, status, attempt, join_group, \
     last_error, locked_at, updated_at, finished_at";

const JOB_COLUMNS: &str = "id, process_type, business_key, payload, status, scheduled_at";

/// PostgreSQL implementation of ProcessStore
///
/// # Example
///
/// ```ignore
/// use procflow_durable::PostgresProcessStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresProcessStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresProcessStore {
    pool: PgPool,
}

impl PostgresProcessStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

#[async_trait]
impl ProcessStore for PostgresProcessStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }

    #[instrument(skip(self, job), fields(process_type = %job.process_type))]
    async fn schedule_job(&self, job: NewScheduledJob) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (process_type, business_key, payload, status, scheduled_at)
            VALUES ($1, $2, $3, 'NEW', $4)
            RETURNING id
            "#,
        )
        .bind(&job.process_type)
        .bind(&job.business_key)
        .bind(&job.payload)
        .bind(job.scheduled_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to schedule job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let job_id: i64 = row.get("id");
        debug!(job_id, "scheduled job");
        Ok(job_id)
    }

    #[instrument(skip(self))]
    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        // Select and lease in one statement; rows held by a concurrent poller
        // are skipped rather than waited on.
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM scheduled_jobs
                WHERE status = 'NEW'
                  AND scheduled_at <= $1
                ORDER BY scheduled_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scheduled_jobs j
            SET status = 'LOCKED',
                locked_at = NOW()
            FROM due
            WHERE j.id = due.id
            RETURNING j.id, j.process_type, j.business_key, j.payload, j.status, j.scheduled_at
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim due jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));

        if !jobs.is_empty() {
            debug!(count = jobs.len(), "claimed due jobs");
        }
        Ok(jobs)
    }

    #[instrument(skip(self))]
    async fn complete_job(&self, job_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'DONE'
            WHERE id = $1 AND status = 'LOCKED'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(job_id, "completed job");
        Ok(())
    }

    async fn get_instance(&self, process_id: i64) -> Result<Option<ProcessInstance>, StoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM process_instance WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(process_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn find_instance(
        &self,
        process_type: &str,
        business_key: &str,
    ) -> Result<Option<ProcessInstance>, StoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM process_instance \
             WHERE process_type = $1 AND business_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(process_type)
            .bind(business_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn get_step(
        &self,
        process_id: i64,
        step_name: &str,
    ) -> Result<Option<ProcessStep>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM process_step \
             WHERE process_instance_id = $1 AND step_name = $2"
        );
        let row = sqlx::query(&sql)
            .bind(process_id)
            .bind(step_name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn list_steps(&self, process_id: i64) -> Result<Vec<ProcessStep>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM process_step \
             WHERE process_instance_id = $1 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(process_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<ScheduledJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

/// An open PostgreSQL transaction
///
/// The underlying sqlx transaction rolls back when dropped uncommitted.
pub struct PostgresTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        let tx = self.tx.as_mut().ok_or(StoreError::TransactionClosed)?;
        Ok(&mut **tx)
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn lock_instance(
        &mut self,
        process_id: i64,
    ) -> Result<Option<ProcessInstance>, StoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM process_instance WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(process_id)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn read_instance(
        &mut self,
        process_id: i64,
    ) -> Result<Option<ProcessInstance>, StoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM process_instance WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(process_id)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn lock_instance_by_key(
        &mut self,
        process_type: &str,
        business_key: &str,
    ) -> Result<Option<ProcessInstance>, StoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM process_instance \
             WHERE process_type = $1 AND business_key = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(process_type)
            .bind(business_key)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self, instance), fields(process_type = %instance.process_type))]
    async fn insert_instance(
        &mut self,
        instance: &NewProcessInstance,
    ) -> Result<Option<i64>, StoreError> {
        // A concurrent insert of the same key blocks here until that
        // transaction ends; if it committed, nothing is returned.
        let row = sqlx::query(
            r#"
            INSERT INTO process_instance (process_type, business_key, status, payload, source_job_id, started_at)
            VALUES ($1, $2, 'RUNNING', $3, $4, NOW())
            ON CONFLICT (process_type, business_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&instance.process_type)
        .bind(&instance.business_key)
        .bind(&instance.payload)
        .bind(instance.source_job_id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(|e| {
            error!("Failed to insert process instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    async fn finish_instance(
        &mut self,
        process_id: i64,
        status: ProcessStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE process_instance
            SET status = $2, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(process_id)
        .bind(status.as_str())
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn lock_step(
        &mut self,
        process_id: i64,
        step_name: &str,
    ) -> Result<Option<ProcessStep>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM process_step \
             WHERE process_instance_id = $1 AND step_name = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(process_id)
            .bind(step_name)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn insert_step(
        &mut self,
        process_id: i64,
        step_name: &str,
        join_group: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO process_step (process_instance_id, step_name, status, attempt, join_group, updated_at)
            VALUES ($1, $2, 'PENDING', 0, $3, NOW())
            ON CONFLICT (process_instance_id, step_name) DO NOTHING
            "#,
        )
        .bind(process_id)
        .bind(step_name)
        .bind(join_group)
        .execute(self.conn()?)
        .await
        .map_err(|e| {
            error!("Failed to insert process step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn lock_join_group(
        &mut self,
        process_id: i64,
        join_group: &str,
    ) -> Result<Vec<ProcessStep>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM process_step \
             WHERE process_instance_id = $1 AND join_group = $2 \
             ORDER BY id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(process_id)
            .bind(join_group)
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn claim_step(&mut self, step_id: i64) -> Result<ProcessStep, StoreError> {
        let sql = format!(
            "UPDATE process_step \
             SET status = 'RUNNING', attempt = attempt + 1, locked_at = NOW(), updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {STEP_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(step_id)
            .fetch_one(self.conn()?)
            .await?;
        step_from_row(&row)
    }

    async fn complete_step(&mut self, step_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE process_step
            SET status = 'DONE', finished_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn fail_step(&mut self, step_id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE process_step
            SET status = 'FAILED', last_error = $2, finished_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(error)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            StoreError::Database(e.to_string())
        })
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.rollback()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

// Helper functions

fn instance_from_row(row: &PgRow) -> Result<ProcessInstance, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ProcessInstance {
        id: row.try_get("id")?,
        process_type: row.try_get("process_type")?,
        business_key: row.try_get("business_key")?,
        status: status.parse()?,
        payload: row.try_get("payload")?,
        source_job_id: row.try_get("source_job_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn step_from_row(row: &PgRow) -> Result<ProcessStep, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ProcessStep {
        id: row.try_get("id")?,
        process_instance_id: row.try_get("process_instance_id")?,
        step_name: row.try_get("step_name")?,
        status: status.parse()?,
        attempt: row.try_get::<i32, _>("attempt")?.max(0) as u32,
        join_group: row.try_get("join_group")?,
        last_error: row.try_get("last_error")?,
        locked_at: row.try_get("locked_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ScheduledJob, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ScheduledJob {
        id: row.try_get("id")?,
        process_type: row.try_get("process_type")?,
        business_key: row.try_get("business_key")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        scheduled_at: row.try_get("scheduled_at")?,
    })
}
