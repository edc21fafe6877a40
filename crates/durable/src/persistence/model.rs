//! Persisted entities: process instances, process steps and scheduled jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::StoreError;

/// Process instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    /// Process is running
    Running,

    /// Process completed successfully
    Completed,

    /// Process failed
    Failed,
}

impl ProcessStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether the instance can no longer change status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(StoreError::InvalidStatus(format!(
                "unknown process status: {}",
                other
            ))),
        }
    }
}

/// Process step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Created, waiting to be claimed
    Pending,

    /// Claimed by an executor
    Running,

    /// Business logic succeeded
    Done,

    /// Business logic failed
    Failed,
}

impl StepStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// DONE and FAILED are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            other => Err(StoreError::InvalidStatus(format!(
                "unknown step status: {}",
                other
            ))),
        }
    }
}

/// Scheduled job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Locked,
    Done,
}

impl JobStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Locked => "LOCKED",
            Self::Done => "DONE",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "LOCKED" => Ok(Self::Locked),
            "DONE" => Ok(Self::Done),
            other => Err(StoreError::InvalidStatus(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// One workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: i64,

    /// Selects the static step graph
    pub process_type: String,

    /// Start-idempotency key; `None` disables deduplication
    pub business_key: Option<String>,

    pub status: ProcessStatus,

    /// Opaque structured data passed through from the trigger
    pub payload: serde_json::Value,

    /// Scheduled job that started this instance, if any
    pub source_job_id: Option<i64>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Data for inserting a new process instance
#[derive(Debug, Clone)]
pub struct NewProcessInstance {
    pub process_type: String,
    pub business_key: Option<String>,
    pub payload: serde_json::Value,
    pub source_job_id: Option<i64>,
}

/// One unit of work within a process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStep {
    pub id: i64,
    pub process_instance_id: i64,

    /// Unique within the owning instance
    pub step_name: String,

    pub status: StepStatus,

    /// Number of claims so far
    pub attempt: u32,

    /// Groups sibling fan-out steps behind one barrier
    pub join_group: Option<String>,

    /// Truncated error text from the last failure
    pub last_error: Option<String>,

    pub locked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// An external request to start a process at or after `scheduled_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub process_type: String,
    pub business_key: Option<String>,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
}

/// Data for queueing a scheduled job
#[derive(Debug, Clone)]
pub struct NewScheduledJob {
    pub process_type: String,
    pub business_key: Option<String>,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
}

impl NewScheduledJob {
    /// Job due immediately
    pub fn now(
        process_type: impl Into<String>,
        business_key: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            process_type: process_type.into(),
            business_key,
            payload,
            scheduled_at: Utc::now(),
        }
    }

    /// Set the due time
    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }
}
