//! PostgreSQL-backed step-task queue
//!
//! Tasks live in `process_step_tasks`. Consumers claim visible rows with
//! `FOR UPDATE SKIP LOCKED` and lease them by pushing `visible_at` forward by
//! the visibility timeout. A claimed row whose lease ran out is claimable
//! again, so a crashed consumer's tasks are redelivered. Failed deliveries
//! become visible again after the retry policy's backoff, or move to the
//! `dead` status once exhausted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};

use super::task::*;
use crate::reliability::RetryPolicy;
use crate::util::truncate_chars;

const MAX_TASK_ERROR_LEN: usize = 4000;

/// PostgreSQL implementation of [`TaskQueue`] and [`TaskSource`]
#[derive(Clone)]
pub struct PostgresTaskQueue {
    pool: PgPool,
    retry_policy: RetryPolicy,
    visibility_timeout: Duration,
}

impl PostgresTaskQueue {
    /// Create a queue with the default redelivery policy
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    /// Set the redelivery policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set how long a received task stays invisible while unacknowledged
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskQueue for PostgresTaskQueue {
    #[instrument(skip(self), fields(task = %task))]
    async fn dispatch(&self, task: StepTask) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO process_step_tasks (process_instance_id, step_name)
            VALUES ($1, $2)
            "#,
        )
        .bind(task.process_id)
        .bind(&task.step_name)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to dispatch step task: {}", e);
            QueueError::Database(e.to_string())
        })?;

        debug!("dispatched step task");
        Ok(())
    }
}

#[async_trait]
impl TaskSource for PostgresTaskQueue {
    #[instrument(skip(self))]
    async fn receive(&self, consumer_id: &str, max: usize) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM process_step_tasks
                WHERE status IN ('pending', 'claimed')
                  AND visible_at <= NOW()
                ORDER BY visible_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE process_step_tasks t
            SET status = 'claimed',
                claimed_by = $2,
                claimed_at = NOW(),
                visible_at = NOW() + make_interval(secs => $3),
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.process_instance_id, t.step_name, t.attempt
            "#,
        )
        .bind(max as i64)
        .bind(consumer_id)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to receive step tasks: {}", e);
            QueueError::Database(e.to_string())
        })?;

        let mut deliveries = rows
            .into_iter()
            .map(|row| -> Result<Delivery, sqlx::Error> {
                Ok(Delivery {
                    id: row.try_get("id")?,
                    task: StepTask {
                        process_id: row.try_get("process_instance_id")?,
                        step_name: row.try_get("step_name")?,
                    },
                    attempt: row.try_get::<i32, _>("attempt")?.max(0) as u32,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        deliveries.sort_by_key(|d| d.id);

        if !deliveries.is_empty() {
            debug!(consumer_id, count = deliveries.len(), "received step tasks");
        }
        Ok(deliveries)
    }

    #[instrument(skip(self, delivery), fields(delivery_id = delivery.id))]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM process_step_tasks WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to ack step task: {}", e);
                QueueError::Database(e.to_string())
            })?;
        Ok(())
    }

    #[instrument(skip(self, delivery, error), fields(delivery_id = delivery.id))]
    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, QueueError> {
        let error = truncate_chars(error, MAX_TASK_ERROR_LEN);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT attempt FROM process_step_tasks WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(delivery.id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            warn!("nack for unknown step task");
            tx.commit().await?;
            return Ok(NackOutcome::Dead);
        };
        let attempt = row.try_get::<i32, _>("attempt")?.max(0) as u32;

        let outcome = if self.retry_policy.has_attempts_remaining(attempt) {
            let next_attempt = attempt + 1;
            let delay = self.retry_policy.delay_for_attempt(next_attempt);
            let visible_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                r#"
                UPDATE process_step_tasks
                SET status = 'pending',
                    claimed_by = NULL,
                    claimed_at = NULL,
                    last_error = $2,
                    visible_at = $3
                WHERE id = $1
                "#,
            )
            .bind(delivery.id)
            .bind(error)
            .bind(visible_at)
            .execute(&mut *tx)
            .await?;

            NackOutcome::Retry {
                next_attempt,
                delay,
            }
        } else {
            sqlx::query(
                r#"
                UPDATE process_step_tasks
                SET status = 'dead', last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(delivery.id)
            .bind(error)
            .execute(&mut *tx)
            .await?;

            warn!(attempt, "step task exhausted redeliveries");
            NackOutcome::Dead
        };

        tx.commit().await?;
        Ok(outcome)
    }
}
