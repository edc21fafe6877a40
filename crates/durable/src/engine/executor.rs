//! Step executor
//!
//! The `StepExecutor` consumes one step task at a time:
//! - Claims the step in a short transaction (PENDING -> RUNNING)
//! - Runs the registered handler outside any transaction
//! - Marks the step DONE or FAILED through the orchestrator
//! - Advances the process graph: join barrier, then the step's own transition
//!
//! Duplicate and stale deliveries are recognised at claim time and dropped
//! without invoking the handler.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::persistence::{ProcessStatus, ProcessStep, ProcessStore, StepStatus, StoreError};
use crate::queue::{StepTask, TaskQueue};

use super::graph::{GraphRegistry, ProcessGraph, Transition};
use super::orchestrator::{
    Orchestrator, OrchestratorError, StepTransition, DEFAULT_MAX_ERROR_LEN,
};
use super::registry::{StepContext, StepError, StepHandler, StepRegistry};

/// Configuration for the step executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Highest attempt at which a RUNNING step may be re-claimed by a redelivery
    pub max_claim_attempts: u32,

    /// Bound on stored step errors, in characters
    pub max_error_len: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_claim_attempts: 1,
            max_error_len: DEFAULT_MAX_ERROR_LEN,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_claim_attempts(mut self, max_claim_attempts: u32) -> Self {
        self.max_claim_attempts = max_claim_attempts;
        self
    }

    pub fn with_max_error_len(mut self, max_error_len: usize) -> Self {
        self.max_error_len = max_error_len;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// No handler is registered for the step name
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// No graph is registered for the process type
    #[error("unknown process type: {0}")]
    UnknownProcessType(String),

    /// A step carries a join group its graph does not join
    #[error("process type '{process_type}' has no successor for join group '{join_group}'")]
    UnknownJoinGroup {
        process_type: String,
        join_group: String,
    },

    /// The handler failed; the step and its process are FAILED
    #[error("step {process_id}/{step_name} failed: {source}")]
    BusinessLogic {
        process_id: i64,
        step_name: String,
        #[source]
        source: StepError,
    },

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ExecutorError {
    /// Whether redelivering the task could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BusinessLogic { source, .. } => source.retryable,
            Self::UnknownStep(_) | Self::UnknownProcessType(_) | Self::UnknownJoinGroup { .. } => {
                false
            }
            Self::Orchestrator(_) | Self::Store(_) => true,
        }
    }
}

/// Why a delivery was dropped without running its handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No step row exists for the task
    StepNotFound,

    /// The step is already DONE or FAILED
    AlreadyTerminal(StepStatus),

    /// The step is RUNNING and has used up its claim attempts
    InFlight { attempt: u32 },
}

/// Result of handling one step task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The handler ran and the step is DONE
    Completed { attempt: u32 },

    /// The handler ran but the step had been marked FAILED meanwhile
    Superseded,

    /// The delivery was a duplicate or stale
    Dropped(DropReason),
}

struct ClaimedStep {
    step: ProcessStep,
    process_type: String,
    payload: serde_json::Value,
    graph: Arc<ProcessGraph>,
    handler: Arc<dyn StepHandler>,
}

enum Claim {
    Claimed(Box<ClaimedStep>),
    Dropped(DropReason),
}

/// Executes step tasks against registered handlers and process graphs
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use procflow_durable::prelude::*;
///
/// # tokio_test::block_on(async {
/// let store = Arc::new(InMemoryProcessStore::new());
/// let queue = Arc::new(InMemoryTaskQueue::new());
///
/// let mut graphs = GraphRegistry::new();
/// graphs.register(ProcessGraph::builder("ping").complete("prepare").build().unwrap());
///
/// let mut steps = StepRegistry::new();
/// steps.register_fn("prepare", |_ctx| async { Ok(()) });
///
/// let executor = StepExecutor::new(store.clone(), queue.clone(), steps, graphs);
/// let started = executor
///     .orchestrator()
///     .start_process("ping", Some("p-1"), serde_json::json!({}), None)
///     .await
///     .unwrap();
///
/// let outcome = executor
///     .execute(&StepTask::new(started.process_id(), "prepare"))
///     .await
///     .unwrap();
/// assert_eq!(outcome, ExecutionOutcome::Completed { attempt: 1 });
/// # });
/// ```
pub struct StepExecutor {
    store: Arc<dyn ProcessStore>,
    orchestrator: Orchestrator,
    steps: StepRegistry,
    graphs: GraphRegistry,
    config: ExecutorConfig,
}

impl StepExecutor {
    /// Create an executor with the default config
    pub fn new(
        store: Arc<dyn ProcessStore>,
        queue: Arc<dyn TaskQueue>,
        steps: StepRegistry,
        graphs: GraphRegistry,
    ) -> Self {
        Self::with_config(store, queue, steps, graphs, ExecutorConfig::default())
    }

    /// Create an executor with a custom config
    pub fn with_config(
        store: Arc<dyn ProcessStore>,
        queue: Arc<dyn TaskQueue>,
        steps: StepRegistry,
        graphs: GraphRegistry,
        config: ExecutorConfig,
    ) -> Self {
        let orchestrator =
            Orchestrator::new(store.clone(), queue).with_max_error_len(config.max_error_len);
        Self {
            store,
            orchestrator,
            steps,
            graphs,
            config,
        }
    }

    /// The orchestrator the executor drives
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Handle one step task
    ///
    /// Returns `Err(ExecutorError::BusinessLogic)` when the handler failed;
    /// by then the step and its process are already FAILED.
    #[instrument(skip(self), fields(process_id = task.process_id, step_name = %task.step_name))]
    pub async fn execute(&self, task: &StepTask) -> Result<ExecutionOutcome, ExecutorError> {
        let claimed = match self.claim(task).await? {
            Claim::Claimed(claimed) => claimed,
            Claim::Dropped(reason) => {
                debug!(?reason, "delivery dropped");
                return Ok(ExecutionOutcome::Dropped(reason));
            }
        };

        let attempt = claimed.step.attempt;
        let ctx = StepContext {
            process_id: task.process_id,
            process_type: claimed.process_type.clone(),
            step_name: task.step_name.clone(),
            attempt,
            payload: claimed.payload.clone(),
        };

        if let Err(err) = claimed.handler.execute(&ctx).await {
            self.orchestrator
                .mark_step_failed(task.process_id, &task.step_name, &err.message)
                .await?;
            return Err(ExecutorError::BusinessLogic {
                process_id: task.process_id,
                step_name: task.step_name.clone(),
                source: err,
            });
        }

        let transition = self
            .orchestrator
            .mark_step_done(task.process_id, &task.step_name)
            .await?;
        if transition == StepTransition::AlreadyFailed {
            warn!("handler succeeded after step was failed, not advancing");
            return Ok(ExecutionOutcome::Superseded);
        }

        self.advance(&claimed).await?;

        debug!(attempt, "step completed");
        Ok(ExecutionOutcome::Completed { attempt })
    }

    /// Claim transaction
    ///
    /// Unknown process types and step names are detected before the step is
    /// touched, and the transaction is rolled back.
    async fn claim(&self, task: &StepTask) -> Result<Claim, ExecutorError> {
        let mut tx = self.store.begin().await?;

        let Some(step) = tx.lock_step(task.process_id, &task.step_name).await? else {
            tx.rollback().await?;
            return Ok(Claim::Dropped(DropReason::StepNotFound));
        };

        if step.status.is_terminal() {
            tx.rollback().await?;
            return Ok(Claim::Dropped(DropReason::AlreadyTerminal(step.status)));
        }

        if step.status == StepStatus::Running && step.attempt > self.config.max_claim_attempts {
            tx.rollback().await?;
            return Ok(Claim::Dropped(DropReason::InFlight {
                attempt: step.attempt,
            }));
        }

        let Some(instance) = tx.read_instance(task.process_id).await? else {
            tx.rollback().await?;
            return Err(OrchestratorError::ProcessNotFound(task.process_id).into());
        };

        let Some(graph) = self.graphs.get(&instance.process_type) else {
            tx.rollback().await?;
            return Err(ExecutorError::UnknownProcessType(instance.process_type));
        };

        let Some(handler) = self.steps.get(&task.step_name) else {
            tx.rollback().await?;
            return Err(ExecutorError::UnknownStep(task.step_name.clone()));
        };

        if instance.status != ProcessStatus::Running {
            debug!(status = %instance.status, "claiming step of a terminal process");
        }

        let step = tx.claim_step(step.id).await?;
        tx.commit().await?;

        if step.attempt > 1 {
            info!(attempt = step.attempt, "re-claimed running step");
        }

        Ok(Claim::Claimed(Box::new(ClaimedStep {
            step,
            process_type: instance.process_type,
            payload: instance.payload,
            graph,
            handler,
        })))
    }

    /// Create whatever follows a DONE step
    async fn advance(&self, claimed: &ClaimedStep) -> Result<(), ExecutorError> {
        let process_id = claimed.step.process_instance_id;
        let step_name = claimed.step.step_name.as_str();

        if let Some(join_group) = &claimed.step.join_group {
            let next = claimed.graph.join_successor(join_group).ok_or_else(|| {
                ExecutorError::UnknownJoinGroup {
                    process_type: claimed.process_type.clone(),
                    join_group: join_group.clone(),
                }
            })?;
            self.orchestrator
                .try_join(process_id, join_group, next)
                .await?;
        }

        match claimed.graph.transition(step_name) {
            Some(Transition::Next(next)) => {
                self.orchestrator
                    .dispatch_successor(process_id, next)
                    .await?;
            }
            Some(Transition::FanOut { join_group, steps }) => {
                self.orchestrator
                    .fan_out(process_id, join_group, steps.as_slice())
                    .await?;
            }
            Some(Transition::Complete) => {
                self.orchestrator.complete_process(process_id).await?;
            }
            None => {}
        }

        Ok(())
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("steps", &self.steps)
            .field("graphs", &self.graphs)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
