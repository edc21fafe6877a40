//! # Durable Process Orchestration
//!
//! A PostgreSQL-backed orchestrator for multi-step business processes with
//! parallel fan-out branches and join barriers, driven by at-least-once
//! step tasks.
//!
//! ## Features
//!
//! - **Idempotent start**: one process instance per `(process_type, business_key)`
//! - **Row-locked claiming**: duplicate and stale deliveries never re-run a finished step
//! - **Join barriers**: exactly one successor dispatch per join group, under any interleaving
//! - **Scheduled jobs**: due jobs leased with `FOR UPDATE SKIP LOCKED` across pollers
//! - **Redelivery backoff**: exponential retry policy with jitter for the task queue
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              JobPoller / WorkerPool (worker)                 │
//! │  (lease scheduled jobs, receive step tasks)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          StepExecutor + Orchestrator (engine)                │
//! │  (claim, run handler, mark DONE/FAILED, fan-out, join)      │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                               │
//!                 ▼                               ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────┐
//! │   ProcessStore (persistence)  │ │    TaskQueue (queue)      │
//! │ process_instance, process_step│ │   process_step_tasks      │
//! │ scheduled_jobs                │ │                           │
//! └───────────────────────────────┘ └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use procflow_durable::prelude::*;
//!
//! let graph = ProcessGraph::builder("order")
//!     .then("prepare", "dispatch")
//!     .fan_out("dispatch", "calls", ["call_a", "call_b", "call_c"])
//!     .join("calls", "finalize")
//!     .complete("finalize")
//!     .build()?;
//!
//! let mut graphs = GraphRegistry::new();
//! graphs.register(graph);
//!
//! let mut steps = StepRegistry::new();
//! steps.register_fn("prepare", |ctx| async move { Ok(()) });
//! // ... one handler per step
//!
//! let executor = Arc::new(StepExecutor::new(store.clone(), queue.clone(), steps, graphs));
//! let pool = WorkerPool::new(executor, queue, WorkerPoolConfig::default());
//! pool.start()?;
//! ```

pub mod engine;
pub mod persistence;
pub mod queue;
pub mod reliability;
mod util;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        ExecutionOutcome, ExecutorConfig, ExecutorError, GraphRegistry, JoinOutcome,
        Orchestrator, OrchestratorError, ProcessGraph, StartOutcome, StepContext, StepError,
        StepExecutor, StepHandler, StepRegistry, StepTransition, Transition,
    };
    pub use crate::persistence::{
        InMemoryProcessStore, JobStatus, NewScheduledJob, PostgresProcessStore, ProcessInstance,
        ProcessStatus, ProcessStep, ProcessStore, ScheduledJob, StepStatus, StoreError,
    };
    pub use crate::queue::{
        InMemoryTaskQueue, PostgresTaskQueue, QueueError, StepTask, TaskQueue, TaskSource,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{
        JobPoller, JobPollerConfig, PollReport, WorkerPool, WorkerPoolConfig, WorkerPoolError,
    };
}

// Re-export key types at crate root
pub use engine::{
    ExecutorConfig, ExecutorError, GraphRegistry, Orchestrator, OrchestratorError, ProcessGraph,
    StepExecutor, StepRegistry,
};
pub use persistence::{
    InMemoryProcessStore, PostgresProcessStore, ProcessStatus, ProcessStore, StepStatus,
    StoreError,
};
pub use queue::{InMemoryTaskQueue, PostgresTaskQueue, StepTask, TaskQueue, TaskSource};
pub use reliability::RetryPolicy;
pub use worker::{JobPoller, JobPollerConfig, WorkerPool, WorkerPoolConfig};
