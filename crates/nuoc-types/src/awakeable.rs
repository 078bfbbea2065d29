//! Awakeable (durable promise) types.
//!
//! An awakeable is created by a running task, handed to some external party
//! by id, and completed later from outside the executing process. Its id is
//! derived from the owning invocation and journal position, so recreating it
//! during replay yields the same id.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::journal::InvocationKey;

/// Prefix of every awakeable id (format version 1).
pub const AWAKEABLE_ID_PREFIX: &str = "awk_1";

/// Errors from decoding an awakeable id.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AwakeableIdError {
    #[error("awakeable id must start with 'awk_1'")]
    MissingPrefix,

    #[error("awakeable id is not valid base64url: {0}")]
    Encoding(String),

    #[error("malformed awakeable id payload: {0}")]
    Malformed(String),
}

/// Deterministic, reversible awakeable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AwakeableId(String);

impl AwakeableId {
    /// Encodes `owner ":" entry_index` behind the version prefix.
    pub fn encode(owner: &InvocationKey, entry_index: u32) -> Self {
        let raw = format!("{owner}:{entry_index}");
        AwakeableId(format!(
            "{AWAKEABLE_ID_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(raw.as_bytes())
        ))
    }

    /// Recovers the owning invocation and journal index.
    pub fn decode(&self) -> Result<(InvocationKey, u32), AwakeableIdError> {
        let body = self
            .0
            .strip_prefix(AWAKEABLE_ID_PREFIX)
            .ok_or(AwakeableIdError::MissingPrefix)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| AwakeableIdError::Encoding(e.to_string()))?;
        let raw = String::from_utf8(bytes).map_err(|e| AwakeableIdError::Malformed(e.to_string()))?;
        let (owner, index) = raw
            .rsplit_once(':')
            .ok_or_else(|| AwakeableIdError::Malformed(raw.clone()))?;
        let index = index
            .parse()
            .map_err(|_| AwakeableIdError::Malformed(format!("bad entry index '{index}'")))?;
        let owner = parse_owner(owner)
            .ok_or_else(|| AwakeableIdError::Malformed(format!("bad owner '{owner}'")))?;
        Ok((owner, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Splits `job/task/attempt`. The job id ends at the first `/` and the
/// attempt starts after the last one, so a task name may itself contain `/`.
fn parse_owner(owner: &str) -> Option<InvocationKey> {
    let (rest, attempt) = owner.rsplit_once('/')?;
    let attempt = attempt.parse().ok()?;
    let (job, task) = rest.split_once('/')?;
    Some(InvocationKey::new(job, task, attempt))
}

impl fmt::Display for AwakeableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AwakeableId {
    type Err = AwakeableIdError;

    /// Accepts only ids that decode cleanly.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = AwakeableId(s.to_string());
        id.decode()?;
        Ok(id)
    }
}

/// Awakeable lifecycle. Leaves `Pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AwakeableStatus {
    Pending,
    Resolved,
    Rejected,
    Timeout,
    Cancelled,
}

impl AwakeableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AwakeableStatus::Pending => "PENDING",
            AwakeableStatus::Resolved => "RESOLVED",
            AwakeableStatus::Rejected => "REJECTED",
            AwakeableStatus::Timeout => "TIMEOUT",
            AwakeableStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AwakeableStatus::Pending)
    }
}

impl fmt::Display for AwakeableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AwakeableStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(AwakeableStatus::Pending),
            "RESOLVED" => Ok(AwakeableStatus::Resolved),
            "REJECTED" => Ok(AwakeableStatus::Rejected),
            "TIMEOUT" => Ok(AwakeableStatus::Timeout),
            "CANCELLED" => Ok(AwakeableStatus::Cancelled),
            other => Err(format!("invalid awakeable status: '{other}'")),
        }
    }
}

/// A persisted durable promise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Awakeable {
    pub id: AwakeableId,
    pub job_id: String,
    pub task_name: String,
    pub attempt: u32,
    pub entry_index: u32,
    pub status: AwakeableStatus,
    /// Resolution payload, or `{"reason": ..}` for rejections.
    pub payload: Option<serde_json::Value>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Awakeable {
    pub fn owner(&self) -> InvocationKey {
        InvocationKey::new(&self.job_id, &self.task_name, self.attempt)
    }
}
