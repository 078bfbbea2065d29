//! Invocation state machine for jobs and tasks.
//!
//! Wraps a `DurableStore` and is the only writer of job and task status.
//! Every transition is checked against the legal-transition tables below and
//! persisted together with its audit `Event` in one `WriteBatch`, with a
//! compare-and-set on the previous status. Committed events are mirrored on
//! the `EventBus`.
//!
//! Callers that need several rows to change together stage each change into
//! one batch (`stage_job`, `stage_task`, ...) and `commit` it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nuoc_types::error::RepositoryError;
use nuoc_types::event::{Event, EventType};
use nuoc_types::job::{CompletionResult, FailureCode, Job, JobStatus};
use nuoc_types::task::{Task, TaskStatus};
use thiserror::Error;

use crate::event::EventBus;
use crate::repository::{DurableStore, JobWrite, TaskWrite, WriteBatch};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// The row changed underneath us (lost compare-and-set).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl StateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::Repository(e) if e.is_retryable())
    }
}

impl From<RepositoryError> for StateError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => StateError::Conflict(msg),
            RepositoryError::NotFound => StateError::NotFound("entity".to_string()),
            other => StateError::Repository(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Transition tables
// ---------------------------------------------------------------------------

/// Legal targets from a job status.
pub fn job_targets(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match from {
        Pending => &[Ready, Scheduled],
        Scheduled => &[Ready],
        Ready => &[Running],
        Running => &[Suspended, BackingOff, Completed],
        Suspended => &[Running],
        BackingOff => &[Running, Paused, Completed],
        Paused => &[Running],
        Completed => &[],
    }
}

pub fn job_transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    job_targets(from).contains(&to)
}

/// Legal targets from a task status.
pub fn task_targets(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Pending => &[Running, Skipped, Cancelled],
        Running => &[Completed, Failed, Suspended, Pending, Cancelled],
        Suspended => &[Pending, Cancelled],
        Completed => &[Pending],
        Skipped => &[Pending],
        Failed => &[Pending],
        Cancelled => &[],
    }
}

pub fn task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    task_targets(from).contains(&to)
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// Validates and persists job and task lifecycle changes.
pub struct StateMachine<S: DurableStore> {
    store: Arc<S>,
    bus: EventBus,
}

impl<S: DurableStore> StateMachine<S> {
    pub fn new(store: Arc<S>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // -----------------------------------------------------------------------
    // Staging
    // -----------------------------------------------------------------------

    /// Stage a legal job transition: updates `job` in place and queues the
    /// guarded write and its event.
    pub fn stage_job(
        &self,
        batch: &mut WriteBatch,
        job: &mut Job,
        to: JobStatus,
        payload: Option<String>,
    ) -> Result<(), StateError> {
        let from = job.status;
        if !job_transition_allowed(from, to) {
            return Err(StateError::InvalidTransition {
                entity: "job",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        apply_job_status(job, to);
        batch.jobs.push(JobWrite {
            job: job.clone(),
            expected: from,
        });
        batch.events.push(
            Event::new(&job.id, EventType::JobStateChange)
                .with_states(from, to)
                .with_payload(payload),
        );
        Ok(())
    }

    /// Stage a write of `job` without a status change.
    pub fn stage_job_update(&self, batch: &mut WriteBatch, job: &mut Job) {
        job.updated_at = Utc::now();
        batch.jobs.push(JobWrite {
            job: job.clone(),
            expected: job.status,
        });
    }

    /// Stage completion of `job` with the given result.
    pub fn stage_completion(
        &self,
        batch: &mut WriteBatch,
        job: &mut Job,
        result: CompletionResult,
        failure: Option<(FailureCode, String)>,
    ) -> Result<(), StateError> {
        let payload = failure.as_ref().map(|(_, reason)| reason.clone());
        set_completion(job, result, failure);
        self.stage_job(batch, job, JobStatus::Completed, payload)
    }

    /// Stage completion/failure from any non-terminal status, bypassing the
    /// table. Used by cancellation.
    pub fn stage_force_complete(
        &self,
        batch: &mut WriteBatch,
        job: &mut Job,
        code: FailureCode,
        reason: &str,
    ) -> Result<(), StateError> {
        let from = job.status;
        if from.is_terminal() {
            return Err(StateError::InvalidTransition {
                entity: "job",
                from: from.to_string(),
                to: JobStatus::Completed.to_string(),
            });
        }
        set_completion(
            job,
            CompletionResult::Failure,
            Some((code, reason.to_string())),
        );
        apply_job_status(job, JobStatus::Completed);
        batch.jobs.push(JobWrite {
            job: job.clone(),
            expected: from,
        });
        batch.events.push(
            Event::new(&job.id, EventType::JobStateChange)
                .with_states(from, JobStatus::Completed)
                .with_payload(Some(reason.to_string())),
        );
        Ok(())
    }

    /// Stage a legal task transition.
    pub fn stage_task(
        &self,
        batch: &mut WriteBatch,
        task: &mut Task,
        to: TaskStatus,
        payload: Option<String>,
    ) -> Result<(), StateError> {
        let from = task.status;
        if !task_transition_allowed(from, to) {
            return Err(StateError::InvalidTransition {
                entity: "task",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        match to {
            TaskStatus::Running => {
                task.started_at.get_or_insert(now);
            }
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Skipped
            | TaskStatus::Cancelled => task.completed_at = Some(now),
            TaskStatus::Pending | TaskStatus::Suspended => {}
        }
        batch.tasks.push(TaskWrite {
            task: task.clone(),
            expected: from,
        });
        batch.events.push(
            Event::new(&task.job_id, EventType::TaskStateChange)
                .for_task(&task.name)
                .with_states(from, to)
                .with_payload(payload),
        );
        Ok(())
    }

    /// Stage a write of `task` without a status change.
    pub fn stage_task_update(&self, batch: &mut WriteBatch, task: &mut Task) {
        task.updated_at = Utc::now();
        batch.tasks.push(TaskWrite {
            task: task.clone(),
            expected: task.status,
        });
    }

    /// Apply a staged batch atomically, then publish its events.
    pub async fn commit(&self, batch: WriteBatch) -> Result<(), StateError> {
        if batch.is_empty() && batch.guards.is_empty() {
            return Ok(());
        }
        self.store.commit(&batch).await?;
        self.bus.publish_all(&batch.events);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Single-entity helpers
    // -----------------------------------------------------------------------

    /// Transition one job. `job` is only updated if the write commits.
    pub async fn transition_job(
        &self,
        job: &mut Job,
        to: JobStatus,
        payload: Option<String>,
    ) -> Result<(), StateError> {
        let mut next = job.clone();
        let mut batch = WriteBatch::default();
        self.stage_job(&mut batch, &mut next, to, payload)?;
        self.commit(batch).await?;
        tracing::debug!(job_id = %job.id, from = %job.status, to = %to, "job transition");
        *job = next;
        Ok(())
    }

    pub async fn complete_job(
        &self,
        job: &mut Job,
        result: CompletionResult,
        failure: Option<(FailureCode, String)>,
    ) -> Result<(), StateError> {
        let mut next = job.clone();
        let mut batch = WriteBatch::default();
        self.stage_completion(&mut batch, &mut next, result, failure)?;
        self.commit(batch).await?;
        tracing::info!(job_id = %job.id, result = %result, "job completed");
        *job = next;
        Ok(())
    }

    /// Transition one task. `task` is only updated if the write commits.
    pub async fn transition_task(
        &self,
        task: &mut Task,
        to: TaskStatus,
        payload: Option<String>,
    ) -> Result<(), StateError> {
        let mut next = task.clone();
        let mut batch = WriteBatch::default();
        self.stage_task(&mut batch, &mut next, to, payload)?;
        self.commit(batch).await?;
        tracing::debug!(
            job_id = %task.job_id,
            task = %task.name,
            from = %task.status,
            to = %to,
            "task transition"
        );
        *task = next;
        Ok(())
    }

    /// Persist field changes of `task` without changing its status.
    pub async fn update_task(&self, task: &mut Task) -> Result<(), StateError> {
        let mut batch = WriteBatch::default();
        self.stage_task_update(&mut batch, task);
        self.commit(batch).await
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    /// Move scheduled jobs whose start time has passed to ready.
    ///
    /// Returns the ids moved. Jobs lost to a concurrent writer are skipped.
    pub async fn scheduler_sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>, StateError> {
        let mut moved = Vec::new();
        for mut job in self.store.list_jobs(Some(JobStatus::Scheduled)).await? {
            if job.scheduled_start_at.is_some_and(|at| at > now) {
                continue;
            }
            match self
                .transition_job(&mut job, JobStatus::Ready, Some("start time reached".into()))
                .await
            {
                Ok(()) => moved.push(job.id),
                Err(StateError::Conflict(_)) => {
                    tracing::debug!(job_id = %job.id, "scheduler sweep lost race, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(moved)
    }

    /// Move backing-off jobs whose retry time has passed to running.
    pub async fn retry_sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>, StateError> {
        let mut moved = Vec::new();
        for mut job in self.store.list_jobs(Some(JobStatus::BackingOff)).await? {
            if job.next_retry_at.is_some_and(|at| at > now) {
                continue;
            }
            job.next_retry_at = None;
            let payload = Some(format!("retry {} of {}", job.retry_count, job.max_retries));
            match self.transition_job(&mut job, JobStatus::Running, payload).await {
                Ok(()) => moved.push(job.id),
                Err(StateError::Conflict(_)) => {
                    tracing::debug!(job_id = %job.id, "retry sweep lost race, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(moved)
    }
}

fn apply_job_status(job: &mut Job, to: JobStatus) {
    let now = Utc::now();
    job.status = to;
    job.updated_at = now;
    match to {
        JobStatus::Running => {
            job.started_at.get_or_insert(now);
        }
        JobStatus::Completed => job.completed_at = Some(now),
        _ => {}
    }
}

fn set_completion(
    job: &mut Job,
    result: CompletionResult,
    failure: Option<(FailureCode, String)>,
) {
    job.completion_result = Some(result);
    job.next_retry_at = None;
    if let Some((code, reason)) = failure {
        job.completion_failure = Some(reason.clone());
        job.last_failure = Some(reason);
        job.last_failure_code = Some(code.as_str().to_string());
    }
}
