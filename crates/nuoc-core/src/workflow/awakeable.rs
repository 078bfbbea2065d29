//! Awakeable manager: durable promises that park a task until an external
//! party completes them.
//!
//! Creation and awaiting are both journaled, so a replayed invocation gets
//! the same id back and re-reads the durable row instead of waiting again.
//! Completion (resolve, reject, timeout) flips the row out of `PENDING`
//! exactly once and, in the same transaction, moves the suspended owner task
//! back to pending with its replay flag set.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nuoc_types::awakeable::{Awakeable, AwakeableId, AwakeableIdError, AwakeableStatus};
use nuoc_types::error::RepositoryError;
use nuoc_types::event::{Event, EventType};
use nuoc_types::journal::{InvocationKey, OpType};
use nuoc_types::task::TaskStatus;
use serde_json::{Value, json};
use thiserror::Error;

use super::journal::{Journal, JournalError};
use super::state::{StateError, StateMachine};
use crate::repository::{AwakeableWrite, DurableStore, Guard, WriteBatch};

/// Attempts at a compare-and-set before giving up with a conflict.
const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum AwakeableError {
    #[error("awakeable not found: {0}")]
    NotFound(String),

    #[error("awakeable {id} is already {status}")]
    AlreadyResolved {
        id: String,
        status: AwakeableStatus,
    },

    #[error("invalid awakeable id: {0}")]
    InvalidId(#[from] AwakeableIdError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl AwakeableError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AwakeableError::Journal(e) => e.is_retryable(),
            AwakeableError::State(e) => e.is_retryable(),
            AwakeableError::Repository(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// What an `await` observed.
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Resolved(Value),
    Rejected(String),
    TimedOut,
    Cancelled,
    /// Still pending: the owner task has been suspended.
    Suspended,
}

fn outcome_of(awakeable: &Awakeable) -> Option<AwaitOutcome> {
    match awakeable.status {
        AwakeableStatus::Pending => None,
        AwakeableStatus::Resolved => Some(AwaitOutcome::Resolved(
            awakeable.payload.clone().unwrap_or(Value::Null),
        )),
        AwakeableStatus::Rejected => Some(AwaitOutcome::Rejected(
            awakeable
                .payload
                .as_ref()
                .and_then(|p| p.get("reason"))
                .and_then(Value::as_str)
                .unwrap_or("rejected")
                .to_string(),
        )),
        AwakeableStatus::Timeout => Some(AwaitOutcome::TimedOut),
        AwakeableStatus::Cancelled => Some(AwaitOutcome::Cancelled),
    }
}

/// Stage the cancellation of a pending awakeable into `batch`.
pub(crate) fn stage_cancel(batch: &mut WriteBatch, awakeable: &Awakeable) {
    let mut next = awakeable.clone();
    next.status = AwakeableStatus::Cancelled;
    next.resolved_at = Some(Utc::now());
    batch.events.push(
        Event::new(&next.job_id, EventType::AwakeableCompleted)
            .for_task(&next.task_name)
            .with_states(AwakeableStatus::Pending, AwakeableStatus::Cancelled)
            .with_payload(Some(next.id.to_string())),
    );
    batch.awakeables.push(AwakeableWrite {
        awakeable: next,
        expected: AwakeableStatus::Pending,
    });
}

/// Creates, awaits and completes awakeables.
pub struct AwakeableManager<S: DurableStore> {
    store: Arc<S>,
    states: Arc<StateMachine<S>>,
    journal: Journal<S>,
}

impl<S: DurableStore> Clone for AwakeableManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            states: self.states.clone(),
            journal: self.journal.clone(),
        }
    }
}

impl<S: DurableStore> AwakeableManager<S> {
    pub fn new(states: Arc<StateMachine<S>>) -> Self {
        let store = states.store().clone();
        Self {
            journal: Journal::new(store.clone()),
            store,
            states,
        }
    }

    pub fn journal(&self) -> &Journal<S> {
        &self.journal
    }

    /// Create a pending awakeable owned by the invocation `key`.
    pub async fn create(
        &self,
        key: &InvocationKey,
        timeout: Option<Duration>,
    ) -> Result<AwakeableId, AwakeableError> {
        let input = json!({ "timeout_ms": timeout.map(|d| d.as_millis() as u64) });
        let output = self
            .journal
            .effect(key, OpType::AwakeableCreate, input, |index| async move {
                let id = AwakeableId::encode(key, index);
                let now = Utc::now();
                let awakeable = Awakeable {
                    id: id.clone(),
                    job_id: key.job_id.clone(),
                    task_name: key.task_name.clone(),
                    attempt: key.attempt,
                    entry_index: index,
                    status: AwakeableStatus::Pending,
                    payload: None,
                    timeout_at: timeout
                        .and_then(|d| chrono::Duration::from_std(d).ok())
                        .and_then(|d| now.checked_add_signed(d)),
                    created_at: now,
                    resolved_at: None,
                };
                let event = Event::new(&key.job_id, EventType::AwakeableCreated)
                    .for_task(&key.task_name)
                    .with_payload(Some(id.to_string()));
                match self.store.insert_awakeable(&awakeable, &event).await {
                    Ok(()) => self.states.bus().publish(event),
                    // Row written before a crash that lost the journal entry.
                    Err(RepositoryError::Conflict(_)) => {
                        tracing::debug!(awakeable = %id, "awakeable already on record");
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(json!({ "id": id }))
            })
            .await?;

        let id = output
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                JournalError::Serialization(format!("awakeable create output without id: {output}"))
            })?
            .parse::<AwakeableId>()?;
        tracing::debug!(invocation = %key, awakeable = %id, "awakeable created");
        Ok(id)
    }

    /// Await an awakeable from within the invocation `key`.
    ///
    /// Returns the terminal outcome if there is one; otherwise suspends the
    /// owner task and returns `AwaitOutcome::Suspended`.
    pub async fn await_completion(
        &self,
        key: &InvocationKey,
        id: &AwakeableId,
    ) -> Result<AwaitOutcome, AwakeableError> {
        self.journal
            .effect(key, OpType::AwakeableAwait, json!({ "id": id }), |_| async {
                Ok(Value::Null)
            })
            .await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let awakeable = self
                .store
                .get_awakeable(id)
                .await?
                .ok_or_else(|| AwakeableError::NotFound(id.to_string()))?;
            if let Some(outcome) = outcome_of(&awakeable) {
                return Ok(outcome);
            }

            let mut task = self
                .store
                .get_task(&key.job_id, &key.task_name)
                .await?
                .ok_or_else(|| StateError::NotFound(format!("task {key}")))?;
            if task.status == TaskStatus::Suspended {
                return Ok(AwaitOutcome::Suspended);
            }

            let mut batch = WriteBatch::default();
            self.states.stage_task(
                &mut batch,
                &mut task,
                TaskStatus::Suspended,
                Some(format!("awaiting awakeable {id}")),
            )?;
            batch.guards.push(Guard::Awakeable {
                id: id.clone(),
                status: AwakeableStatus::Pending,
            });
            match self.states.commit(batch).await {
                Ok(()) => {
                    tracing::info!(invocation = %key, awakeable = %id, "task suspended");
                    return Ok(AwaitOutcome::Suspended);
                }
                // Completed between our read and the write: read it again.
                Err(StateError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict(format!("awakeable {id} kept changing while suspending")).into())
    }

    /// Resolve with a payload and wake the owner.
    pub async fn resolve(&self, id: &AwakeableId, payload: Value) -> Result<Awakeable, AwakeableError> {
        self.complete(id, AwakeableStatus::Resolved, Some(payload)).await
    }

    /// Reject with a reason and wake the owner; its await fails the attempt.
    pub async fn reject(&self, id: &AwakeableId, reason: &str) -> Result<Awakeable, AwakeableError> {
        self.complete(
            id,
            AwakeableStatus::Rejected,
            Some(json!({ "reason": reason })),
        )
        .await
    }

    /// Time out every pending awakeable whose deadline has passed.
    pub async fn timeout_sweep(&self, now: DateTime<Utc>) -> Result<Vec<AwakeableId>, AwakeableError> {
        let mut timed_out = Vec::new();
        for awakeable in self.store.list_expired_awakeables(now).await? {
            match self.complete(&awakeable.id, AwakeableStatus::Timeout, None).await {
                Ok(_) => timed_out.push(awakeable.id),
                Err(AwakeableError::AlreadyResolved { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(timed_out)
    }

    async fn complete(
        &self,
        id: &AwakeableId,
        status: AwakeableStatus,
        payload: Option<Value>,
    ) -> Result<Awakeable, AwakeableError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .store
                .get_awakeable(id)
                .await?
                .ok_or_else(|| AwakeableError::NotFound(id.to_string()))?;
            if current.status != AwakeableStatus::Pending {
                return Err(AwakeableError::AlreadyResolved {
                    id: id.to_string(),
                    status: current.status,
                });
            }

            let mut next = current.clone();
            next.status = status;
            next.payload = payload.clone();
            next.resolved_at = Some(Utc::now());

            let mut batch = WriteBatch::default();
            batch.awakeables.push(AwakeableWrite {
                awakeable: next.clone(),
                expected: AwakeableStatus::Pending,
            });
            batch.events.push(
                Event::new(&next.job_id, EventType::AwakeableCompleted)
                    .for_task(&next.task_name)
                    .with_states(AwakeableStatus::Pending, status)
                    .with_payload(Some(id.to_string())),
            );

            match self.store.get_task(&next.job_id, &next.task_name).await? {
                Some(mut task)
                    if task.status == TaskStatus::Suspended && task.invocation == next.attempt =>
                {
                    task.replay = true;
                    self.states.stage_task(
                        &mut batch,
                        &mut task,
                        TaskStatus::Pending,
                        Some(format!(
                            "awakeable {id} {}",
                            status.as_str().to_lowercase()
                        )),
                    )?;
                }
                Some(task) => batch.guards.push(Guard::Task {
                    job_id: task.job_id,
                    name: task.name,
                    status: task.status,
                }),
                None => {}
            }

            match self.states.commit(batch).await {
                Ok(()) => {
                    tracing::info!(awakeable = %id, status = %status, job_id = %next.job_id, "awakeable completed");
                    return Ok(next);
                }
                Err(StateError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict(format!("awakeable {id} kept changing while completing")).into())
    }
}
