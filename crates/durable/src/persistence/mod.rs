//! Persistence layer for process orchestration
//!
//! This module provides:
//! - The persisted entities ([`ProcessInstance`], [`ProcessStep`], [`ScheduledJob`])
//! - [`ProcessStore`] / [`StoreTransaction`] traits for lock-based persistence
//! - [`PostgresProcessStore`] for production
//! - [`InMemoryProcessStore`] for testing

mod memory;
mod model;
mod postgres;
mod store;

pub use memory::{InMemoryProcessStore, InMemoryTransaction};
pub use model::{
    JobStatus, NewProcessInstance, NewScheduledJob, ProcessInstance, ProcessStatus, ProcessStep,
    ScheduledJob, StepStatus,
};
pub use postgres::{PostgresProcessStore, PostgresTransaction};
pub use store::{ProcessStore, StoreError, StoreTransaction};
