//! Background workers
//!
//! This module provides:
//! - [`JobPoller`] - Turns due scheduled jobs into started processes
//! - [`WorkerPool`] - Concurrent step execution fed by a task source
//! - [`TaskPoller`] - Task polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     startProcess      ┌──────────────────────┐
//! │    JobPoller     │ ────────────────────▶ │     Orchestrator     │
//! │ (scheduled_jobs) │                       │ (dispatch after tx)  │
//! └──────────────────┘                       └──────────┬───────────┘
//!                                                       │ StepTask
//!                                                       ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          WorkerPool                             │
//! │  ┌─────────────┐      ┌──────────────────────────────────────┐  │
//! │  │ TaskPoller  │ ───▶ │  StepExecutor (semaphore-limited)    │  │
//! │  │  (backoff)  │      │  [Step 1] [Step 2] ... [Step N]      │  │
//! │  └─────────────┘      └──────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod job_poller;
mod poller;
mod pool;

pub use job_poller::{JobPoller, JobPollerConfig, JobPollerError, PollReport};
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
