//! Process orchestration engine
//!
//! The engine module provides:
//! - [`Orchestrator`]: transactional process and step transitions (start,
//!   fan-out, join barrier, terminal marking)
//! - [`StepExecutor`]: the claim-and-execute protocol for one step task
//! - [`StepRegistry`]: business handlers keyed by step name
//! - [`ProcessGraph`] / [`GraphRegistry`]: static step graphs per process type

mod executor;
mod graph;
mod orchestrator;
mod registry;

pub use executor::{DropReason, ExecutionOutcome, ExecutorConfig, ExecutorError, StepExecutor};
pub use graph::{
    GraphError, GraphRegistry, ProcessGraph, ProcessGraphBuilder, Transition, INITIAL_STEP,
};
pub use orchestrator::{
    JoinOutcome, Orchestrator, OrchestratorError, StartOutcome, StepTransition,
    DEFAULT_MAX_ERROR_LEN,
};
pub use registry::{StepContext, StepError, StepHandler, StepRegistry};
