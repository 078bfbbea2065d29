//! Job domain types.
//!
//! A job is one execution of a task graph. Its lifecycle is the 8-state
//! `JobStatus` machine; transitions are validated in nuoc-core.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Ready,
    Running,
    Suspended,
    BackingOff,
    Paused,
    Completed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Scheduled,
        JobStatus::Ready,
        JobStatus::Running,
        JobStatus::Suspended,
        JobStatus::BackingOff,
        JobStatus::Paused,
        JobStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Suspended => "suspended",
            JobStatus::BackingOff => "backing-off",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid job status: '{s}'"))
    }
}

/// Final result of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionResult {
    Success,
    Failure,
}

impl CompletionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionResult::Success => "success",
            CompletionResult::Failure => "failure",
        }
    }
}

impl fmt::Display for CompletionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompletionResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(CompletionResult::Success),
            "failure" => Ok(CompletionResult::Failure),
            other => Err(format!("invalid completion result: '{other}'")),
        }
    }
}

/// Machine-readable classification of why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    /// A task exhausted its attempts without a regression target.
    TaskFailed,
    /// No task was runnable, but not every task had finished.
    Deadlock,
    /// Regression was requested more often than `max_regressions` allows.
    RegressionLimit,
    Cancelled,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::TaskFailed => "task_failed",
            FailureCode::Deadlock => "deadlock",
            FailureCode::RegressionLimit => "regression_limit",
            FailureCode::Cancelled => "cancelled",
        }
    }
}

/// Completion reason written for cancelled jobs.
pub const CANCELLED_REASON: &str = "cancelled";

/// A job as persisted in the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id, also its display name.
    pub id: String,
    pub status: JobStatus,
    /// Scheduling tier; lower positions run first.
    pub position: i64,
    /// Caller-provided correlation id.
    pub external_id: Option<String>,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    /// Only set once `status` is `Completed`.
    pub completion_result: Option<CompletionResult>,
    pub completion_failure: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_scaling: f64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub last_failure_code: Option<String>,
    pub regression_count: u32,
    pub max_regressions: u32,
    /// Jobs that must complete successfully before this one may run.
    pub depends_on: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_cancelled(&self) -> bool {
        self.status == JobStatus::Completed
            && self.completion_result == Some(CompletionResult::Failure)
            && self.completion_failure.as_deref() == Some(CANCELLED_REASON)
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
            && self.completion_result == Some(CompletionResult::Success)
    }
}
