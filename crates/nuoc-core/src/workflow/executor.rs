//! Task executor: runs one task through its attempts.
//!
//! # Execution flow
//!
//! 1. Completed tasks return their recorded output; other settled states are
//!    reported as they are.
//! 2. A false branch condition skips the task.
//! 3. Each attempt moves the task to running and either re-enters the
//!    current invocation (replay flag set) or opens a new one with the next
//!    attempt number, then initialises the journal cursor.
//! 4. The handler runs with a `TaskContext`; its output must pass the gate.
//! 5. Failures back off and retry up to `max_attempts`; a journal divergence
//!    fails immediately. An exhausted task is marked failed and reports its
//!    regression target.
//! 6. A handler that awaits a pending awakeable leaves the task suspended.

use std::collections::HashMap;
use std::sync::Arc;

use nuoc_types::error::RepositoryError;
use nuoc_types::journal::InvocationKey;
use nuoc_types::task::{Task, TaskStatus};
use serde_json::Value;
use thiserror::Error;

use super::awakeable::AwakeableManager;
use super::condition::evaluate;
use super::gate::GateRegistry;
use super::handler::{HandlerRegistry, InvocationRuntime, TaskContext, TaskError};
use super::journal::JournalError;
use super::retry::RetryHandler;
use super::state::{StateError, StateMachine};
use crate::repository::DurableStore;

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Failures of the executor itself, as opposed to failures of the task.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task {job_id}/{task} not found")]
    TaskNotFound { job_id: String, task: String },

    #[error("task {job_id}/{task} is {status} and cannot be started")]
    NotRunnable {
        job_id: String,
        task: String,
        status: TaskStatus,
    },

    /// Storage failed underneath a running handler; the task stays running
    /// until the job is resumed.
    #[error("infrastructure failure in task {task}: {source}")]
    Infrastructure {
        task: String,
        #[source]
        source: TaskError,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutorError::Infrastructure { .. } => true,
            ExecutorError::State(e) => e.is_retryable(),
            ExecutorError::Journal(e) => e.is_retryable(),
            ExecutorError::Repository(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Skipped,
    Suspended,
    /// Attempts exhausted (or fatal error); carries the regression target.
    Failed {
        error: String,
        regress_to: Option<String>,
    },
    Cancelled,
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

/// Runs tasks with retries, gates, journaling and suspension.
pub struct TaskExecutor<S: DurableStore> {
    store: Arc<S>,
    states: Arc<StateMachine<S>>,
    awakeables: AwakeableManager<S>,
    runtime: Arc<dyn InvocationRuntime>,
    handlers: Arc<HandlerRegistry>,
    gates: Arc<GateRegistry>,
}

impl<S: DurableStore> TaskExecutor<S> {
    pub fn new(
        states: Arc<StateMachine<S>>,
        awakeables: AwakeableManager<S>,
        handlers: Arc<HandlerRegistry>,
        gates: Arc<GateRegistry>,
    ) -> Self {
        Self {
            store: states.store().clone(),
            runtime: Arc::new(awakeables.clone()),
            states,
            awakeables,
            handlers,
            gates,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn gates(&self) -> &GateRegistry {
        &self.gates
    }

    async fn load(&self, job_id: &str, name: &str) -> Result<Task, ExecutorError> {
        self.store
            .get_task(job_id, name)
            .await?
            .ok_or_else(|| ExecutorError::TaskNotFound {
                job_id: job_id.to_string(),
                task: name.to_string(),
            })
    }

    /// Called after losing a compare-and-set on the task row.
    async fn interrupted(&self, job_id: &str, name: &str) -> Result<TaskOutcome, ExecutorError> {
        let current = self.load(job_id, name).await?;
        if current.status == TaskStatus::Cancelled {
            tracing::info!(job_id, task = name, "task cancelled while running");
            return Ok(TaskOutcome::Cancelled);
        }
        Err(StateError::Conflict(format!(
            "task {job_id}/{name} changed to {} while running",
            current.status
        ))
        .into())
    }

    /// Gate verdict for `output`; `None` means it passed.
    fn gate_rejection(&self, task: &Task, output: &Value) -> Option<String> {
        let gate = task.gate.as_deref()?;
        let text = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let verdict = self.gates.check(gate, &text, &task.job_id);
        (!verdict.pass).then(|| format!("gate '{gate}' rejected output: {}", verdict.reason))
    }

    /// Run the task `(job_id, name)` to an outcome.
    pub async fn execute(&self, job_id: &str, name: &str) -> Result<TaskOutcome, ExecutorError> {
        let mut task = self.load(job_id, name).await?;
        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Completed => {
                return Ok(TaskOutcome::Completed(task.output.unwrap_or(Value::Null)));
            }
            TaskStatus::Skipped => return Ok(TaskOutcome::Skipped),
            TaskStatus::Suspended => return Ok(TaskOutcome::Suspended),
            TaskStatus::Cancelled => return Ok(TaskOutcome::Cancelled),
            TaskStatus::Failed => {
                return Ok(TaskOutcome::Failed {
                    error: task.error.unwrap_or_default(),
                    regress_to: task.regress_to,
                });
            }
            TaskStatus::Running => {
                return Err(ExecutorError::NotRunnable {
                    job_id: job_id.to_string(),
                    task: name.to_string(),
                    status: task.status,
                });
            }
        }

        let siblings = self.store.list_tasks(job_id).await?;
        let by_name: HashMap<&str, &Task> = siblings.iter().map(|t| (t.name.as_str(), t)).collect();
        let inputs: HashMap<String, Value> = task
            .depends_on
            .iter()
            .filter_map(|dep| by_name.get(dep.as_str()))
            .filter(|dep| dep.status == TaskStatus::Completed)
            .map(|dep| (dep.var.clone(), dep.output.clone().unwrap_or(Value::Null)))
            .collect();

        if let Some(condition) = &task.condition {
            let holds = match by_name.get(condition.task.as_str()) {
                Some(dep) if dep.status == TaskStatus::Completed => evaluate(
                    &condition.predicate,
                    dep.output.as_ref().unwrap_or(&Value::Null),
                ),
                _ => false,
            };
            if !holds {
                let reason = format!("condition on '{}' not met", condition.task);
                tracing::info!(job_id, task = name, %reason, "task skipped");
                return match self
                    .states
                    .transition_task(&mut task, TaskStatus::Skipped, Some(reason))
                    .await
                {
                    Ok(()) => Ok(TaskOutcome::Skipped),
                    Err(StateError::Conflict(_)) => self.interrupted(job_id, name).await,
                    Err(e) => Err(e.into()),
                };
            }
        }

        let handler = self.handlers.get(&task.handler);

        loop {
            // Re-entering an invocation continues its attempt.
            if task.replay {
                task.replay = false;
                task.attempt = task.attempt.max(1);
            } else {
                task.invocation += 1;
                task.attempt += 1;
            }
            let started = if task.status == TaskStatus::Pending {
                let payload = Some(format!("attempt {}", task.attempt));
                self.states
                    .transition_task(&mut task, TaskStatus::Running, payload)
                    .await
            } else {
                self.states.update_task(&mut task).await
            };
            match started {
                Ok(()) => {}
                Err(StateError::Conflict(_)) => return self.interrupted(job_id, name).await,
                Err(e) => return Err(e.into()),
            }

            let key = InvocationKey::new(job_id, name, task.invocation);
            self.awakeables.journal().init_context(&key).await?;
            let ctx = TaskContext::new(
                key,
                task.attempt,
                task.params.clone(),
                inputs.clone(),
                self.runtime.clone(),
            );
            tracing::info!(
                job_id,
                task = name,
                attempt = task.attempt,
                invocation = task.invocation,
                "task attempt started"
            );

            let result = match &handler {
                Some(handler) => handler.execute_boxed(&ctx).await,
                None => Err(TaskError::failed(format!(
                    "no handler registered as '{}'",
                    task.handler
                ))),
            };

            let mut fatal = handler.is_none();
            let failure = match result {
                Ok(output) => match self.gate_rejection(&task, &output) {
                    None => {
                        task.output = Some(output.clone());
                        task.error = None;
                        return match self
                            .states
                            .transition_task(&mut task, TaskStatus::Completed, None)
                            .await
                        {
                            Ok(()) => {
                                tracing::info!(job_id, task = name, attempt = task.attempt, "task completed");
                                Ok(TaskOutcome::Completed(output))
                            }
                            Err(StateError::Conflict(_)) => self.interrupted(job_id, name).await,
                            Err(e) => Err(e.into()),
                        };
                    }
                    Some(rejection) => rejection,
                },
                Err(TaskError::Suspended) => {
                    tracing::info!(job_id, task = name, "task suspended");
                    return Ok(TaskOutcome::Suspended);
                }
                Err(e) if e.is_infrastructure() => {
                    return Err(ExecutorError::Infrastructure {
                        task: name.to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    fatal |= e.is_fatal();
                    e.to_string()
                }
            };

            task.error = Some(failure.clone());
            if fatal || !RetryHandler::should_retry(task.attempt, task.max_attempts) {
                tracing::warn!(
                    job_id,
                    task = name,
                    attempt = task.attempt,
                    error = %failure,
                    "task failed"
                );
                return match self
                    .states
                    .transition_task(&mut task, TaskStatus::Failed, Some(failure.clone()))
                    .await
                {
                    Ok(()) => Ok(TaskOutcome::Failed {
                        error: failure,
                        regress_to: task.regress_to.clone(),
                    }),
                    Err(StateError::Conflict(_)) => self.interrupted(job_id, name).await,
                    Err(e) => Err(e.into()),
                };
            }

            let delay = RetryHandler::backoff_delay(task.attempt, task.retry_delay_ms, task.retry_scaling);
            tracing::warn!(
                job_id,
                task = name,
                attempt = task.attempt,
                max_attempts = task.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "task attempt failed, retrying"
            );
            match self.states.update_task(&mut task).await {
                Ok(()) => {}
                Err(StateError::Conflict(_)) => return self.interrupted(job_id, name).await,
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(delay).await;

            task = self.load(job_id, name).await?;
            if task.status != TaskStatus::Running {
                return self.interrupted(job_id, name).await;
            }
        }
    }
}
