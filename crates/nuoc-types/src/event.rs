//! Audit events.
//!
//! Every state change writes one immutable `Event` in the same transaction as
//! the change itself. The same values are broadcast on the in-process event
//! bus, so they are Clone + Send + Sync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.Submitted")]
    JobSubmitted,
    #[serde(rename = "job.StateChange")]
    JobStateChange,
    #[serde(rename = "task.StateChange")]
    TaskStateChange,
    #[serde(rename = "task.Regressed")]
    TaskRegressed,
    #[serde(rename = "awakeable.Created")]
    AwakeableCreated,
    #[serde(rename = "awakeable.Completed")]
    AwakeableCompleted,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::JobSubmitted,
        EventType::JobStateChange,
        EventType::TaskStateChange,
        EventType::TaskRegressed,
        EventType::AwakeableCreated,
        EventType::AwakeableCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobSubmitted => "job.Submitted",
            EventType::JobStateChange => "job.StateChange",
            EventType::TaskStateChange => "task.StateChange",
            EventType::TaskRegressed => "task.Regressed",
            EventType::AwakeableCreated => "awakeable.Created",
            EventType::AwakeableCompleted => "awakeable.Completed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("invalid event type: '{s}'"))
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub job_id: String,
    pub task_name: Option<String>,
    pub event_type: EventType,
    pub old_state: Option<String>,
    pub new_state: Option<String>,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(job_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: job_id.into(),
            task_name: None,
            event_type,
            old_state: None,
            new_state: None,
            payload: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    pub fn with_states(mut self, old: impl fmt::Display, new: impl fmt::Display) -> Self {
        self.old_state = Some(old.to_string());
        self.new_state = Some(new.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Option<String>) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
            assert_eq!(serde_json::to_string(&t).unwrap(), format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn test_event_builder() {
        let event = Event::new("job1", EventType::TaskStateChange)
            .for_task("build")
            .with_states("suspended", "pending")
            .with_payload(Some("awakeable awk_1x resolved".to_string()));
        assert_eq!(event.task_name.as_deref(), Some("build"));
        assert_eq!(event.old_state.as_deref(), Some("suspended"));
        assert_eq!(event.new_state.as_deref(), Some("pending"));
        assert!(event.payload.unwrap().contains("resolved"));
    }
}
