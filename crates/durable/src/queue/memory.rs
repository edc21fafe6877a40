//! In-memory step-task queue for testing

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::task::*;
use crate::reliability::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Pending,
    Claimed,
    Dead,
}

#[derive(Debug)]
struct Entry {
    task: StepTask,
    status: EntryStatus,
    attempt: u32,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: BTreeMap<i64, Entry>,
    dispatched: Vec<StepTask>,
    last_id: i64,
}

/// In-memory implementation of [`TaskQueue`] and [`TaskSource`]
///
/// Every dispatch is also recorded so tests can assert how many times a
/// task was published; [`clear_dispatched`](Self::clear_dispatched) resets
/// that log. A received delivery that is neither acked nor nacked within the
/// visibility timeout is delivered again.
///
/// # Example
///
/// ```
/// use procflow_durable::InMemoryTaskQueue;
///
/// let queue = InMemoryTaskQueue::new();
/// assert!(queue.dispatched().is_empty());
/// ```
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    retry_policy: RetryPolicy,
    visibility_timeout: Duration,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }
}

impl InMemoryTaskQueue {
    /// Create a queue with the default redelivery policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue with a custom redelivery policy
    pub fn with_retry_policy(retry_policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            retry_policy,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    /// Set how long a delivery stays invisible while unacknowledged
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Forget the dispatch log
    pub fn clear_dispatched(&self) {
        self.state.lock().dispatched.clear();
    }

    /// Every task ever dispatched, in order
    pub fn dispatched(&self) -> Vec<StepTask> {
        self.state.lock().dispatched.clone()
    }

    /// How many times a given task was dispatched
    pub fn dispatch_count(&self, process_id: i64, step_name: &str) -> usize {
        self.state
            .lock()
            .dispatched
            .iter()
            .filter(|t| t.process_id == process_id && t.step_name == step_name)
            .count()
    }

    /// Number of tasks waiting for delivery
    pub fn pending_count(&self) -> usize {
        self.count(EntryStatus::Pending)
    }

    /// Number of dead-lettered tasks
    pub fn dead_count(&self) -> usize {
        self.count(EntryStatus::Dead)
    }

    /// Remove and return all pending tasks regardless of visibility
    pub fn drain_pending(&self) -> Vec<StepTask> {
        let mut state = self.state.lock();
        let ids: Vec<i64> = state
            .entries
            .iter()
            .filter(|(_, e)| e.status == EntryStatus::Pending)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| state.entries.remove(&id))
            .map(|e| e.task)
            .collect()
    }

    fn count(&self, status: EntryStatus) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.status == status)
            .count()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn dispatch(&self, task: StepTask) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.last_id += 1;
        let id = state.last_id;
        state.dispatched.push(task.clone());
        state.entries.insert(
            id,
            Entry {
                task,
                status: EntryStatus::Pending,
                attempt: 0,
                visible_at: Instant::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl TaskSource for InMemoryTaskQueue {
    async fn receive(&self, _consumer_id: &str, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let lease_until = now + self.visibility_timeout;
        let mut state = self.state.lock();

        let mut deliveries = Vec::new();
        for (id, entry) in state.entries.iter_mut() {
            if deliveries.len() >= max {
                break;
            }
            let receivable = matches!(entry.status, EntryStatus::Pending | EntryStatus::Claimed);
            if receivable && entry.visible_at <= now {
                entry.status = EntryStatus::Claimed;
                entry.attempt += 1;
                entry.visible_at = lease_until;
                deliveries.push(Delivery {
                    id: *id,
                    task: entry.task.clone(),
                    attempt: entry.attempt,
                });
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state.lock().entries.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, _error: &str) -> Result<NackOutcome, QueueError> {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&delivery.id) else {
            return Ok(NackOutcome::Dead);
        };

        if self.retry_policy.has_attempts_remaining(entry.attempt) {
            let next_attempt = entry.attempt + 1;
            let delay = self.retry_policy.delay_for_attempt(next_attempt);
            entry.status = EntryStatus::Pending;
            entry.visible_at = Instant::now() + delay;
            Ok(NackOutcome::Retry {
                next_attempt,
                delay,
            })
        } else {
            entry.status = EntryStatus::Dead;
            Ok(NackOutcome::Dead)
        }
    }
}
