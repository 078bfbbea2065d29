//! Replay journal types.
//!
//! Every side effect a task performs is recorded as a `JournalEntry` keyed by
//! `(job_id, task_name, attempt, entry_index)`. On a later run of the same
//! invocation the recorded outputs are returned instead of re-executing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Catalog of journal entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Run,
    AwakeableCreate,
    AwakeableAwait,
    AwakeableComplete,
    GetState,
    SetState,
    ClearState,
    Sleep,
    Call,
    OneWayCall,
    Input,
    Output,
}

impl OpType {
    pub const ALL: [OpType; 12] = [
        OpType::Run,
        OpType::AwakeableCreate,
        OpType::AwakeableAwait,
        OpType::AwakeableComplete,
        OpType::GetState,
        OpType::SetState,
        OpType::ClearState,
        OpType::Sleep,
        OpType::Call,
        OpType::OneWayCall,
        OpType::Input,
        OpType::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Run => "run",
            OpType::AwakeableCreate => "awakeable_create",
            OpType::AwakeableAwait => "awakeable_await",
            OpType::AwakeableComplete => "awakeable_complete",
            OpType::GetState => "get_state",
            OpType::SetState => "set_state",
            OpType::ClearState => "clear_state",
            OpType::Sleep => "sleep",
            OpType::Call => "call",
            OpType::OneWayCall => "one_way_call",
            OpType::Input => "input",
            OpType::Output => "output",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpType::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("invalid op type: '{s}'"))
    }
}

/// Identifies one invocation of a task: the journal key prefix.
///
/// Rendered as `job_id/task_name/attempt`. Job and task names are identifiers
/// and never contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationKey {
    pub job_id: String,
    pub task_name: String,
    pub attempt: u32,
}

impl InvocationKey {
    pub fn new(job_id: impl Into<String>, task_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            job_id: job_id.into(),
            task_name: task_name.into(),
            attempt,
        }
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.job_id, self.task_name, self.attempt)
    }
}

impl FromStr for InvocationKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(job), Some(task), Some(attempt), None) if !job.is_empty() && !task.is_empty() => {
                let attempt = attempt
                    .parse()
                    .map_err(|_| format!("invalid attempt in invocation key: '{s}'"))?;
                Ok(InvocationKey::new(job, task, attempt))
            }
            _ => Err(format!("invalid invocation key: '{s}'")),
        }
    }
}

/// One immutable journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub job_id: String,
    pub task_name: String,
    /// Invocation ordinal of the task (see `Task::invocation`).
    pub attempt: u32,
    pub entry_index: u32,
    pub op_type: OpType,
    /// Hex SHA-256 of the serialized input.
    pub input_hash: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Replay cursor for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub job_id: String,
    pub task_name: String,
    pub attempt: u32,
    /// Index handed out by the next `advance`.
    pub entry_index: u32,
    /// Entries already on record when the invocation (re)started.
    pub known_entries: u32,
    pub replay_mode: bool,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(key: &InvocationKey, known_entries: u32) -> Self {
        Self {
            job_id: key.job_id.clone(),
            task_name: key.task_name.clone(),
            attempt: key.attempt,
            entry_index: 0,
            known_entries,
            replay_mode: known_entries > 0,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> InvocationKey {
        InvocationKey::new(&self.job_id, &self.task_name, self.attempt)
    }

    /// Returns the current index and whether it falls inside the recorded
    /// prefix, then moves the cursor forward. Replay mode only ever turns off.
    pub fn advance(&mut self) -> (u32, bool) {
        let index = self.entry_index;
        let replaying = index < self.known_entries;
        self.entry_index += 1;
        self.replay_mode = self.replay_mode && self.entry_index < self.known_entries;
        self.updated_at = Utc::now();
        (index, replaying)
    }
}
