//! Task domain types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::BranchCondition;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
    Suspended,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Skipped,
        TaskStatus::Failed,
        TaskStatus::Suspended,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Failed => "failed",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Completed or skipped: downstream tasks may proceed.
    pub fn is_settled(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid task status: '{s}'"))
    }
}

/// Per-task retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_scaling_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            scaling_factor: default_scaling_factor(),
        }
    }
}

/// A task as persisted in the durable store. Identified by `(job_id, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub job_id: String,
    pub name: String,
    pub status: TaskStatus,
    /// Names of tasks in the same job that must settle first.
    pub depends_on: Vec<String>,
    /// Registered handler that runs this task.
    pub handler: String,
    pub params: serde_json::Value,
    /// Name under which downstream tasks see this task's output.
    pub var: String,
    pub gate: Option<String>,
    pub condition: Option<BranchCondition>,
    pub regress_to: Option<String>,
    pub priority: i32,
    /// Retry counter for the current run of the task; reset by regression.
    pub attempt: u32,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_scaling: f64,
    /// Lifetime attempt ordinal. Keys the journal; never reset.
    pub invocation: u32,
    /// When set, the next start re-enters `invocation` instead of opening a new one.
    pub replay: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Clears the run state so the task can start over.
    pub fn clear_run_state(&mut self) {
        self.output = None;
        self.error = None;
        self.attempt = 0;
        self.started_at = None;
        self.completed_at = None;
    }
}
