//! DAG scheduler: submission, level-by-level dispatch, regression,
//! crash recovery and cancellation.
//!
//! The scheduler keeps no authoritative state in memory. Every loop
//! iteration re-reads task rows from the store, so a run can be resumed by
//! any process after a crash.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nuoc_types::config::EngineConfig;
use nuoc_types::definition::JobDefinition;
use nuoc_types::error::RepositoryError;
use nuoc_types::event::{Event, EventType};
use nuoc_types::job::{CANCELLED_REASON, CompletionResult, FailureCode, Job, JobStatus};
use nuoc_types::awakeable::AwakeableStatus;
use nuoc_types::task::{Task, TaskStatus};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::awakeable::{AwakeableError, AwakeableManager, stage_cancel};
use super::dag::{TaskGraph, ready_set};
use super::definition::{DefinitionDefaults, DefinitionError, build_job, validate_definition};
use super::executor::{ExecutorError, TaskExecutor, TaskOutcome};
use super::gate::GateRegistry;
use super::handler::HandlerRegistry;
use super::retry::RetryHandler;
use super::state::{StateError, StateMachine};
use crate::event::EventBus;
use crate::repository::{DurableStore, WriteBatch};

/// Retries of a multi-row write that lost a compare-and-set race.
const MAX_CAS_ATTEMPTS: usize = 5;

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("job '{0}' already exists")]
    AlreadyExists(String),

    #[error("job '{job_id}' has no task '{task}'")]
    UnknownTask { job_id: String, task: String },

    #[error("job '{job_id}' waits on unfinished jobs: {}", .pending.join(", "))]
    DependenciesUnmet { job_id: String, pending: Vec<String> },

    #[error("job '{job_id}' is not due until {at}")]
    NotDue { job_id: String, at: DateTime<Utc> },

    #[error("job '{job_id}' is {status}")]
    NotRunnable { job_id: String, status: JobStatus },

    #[error("job '{job_id}' exceeded its regression limit of {limit}")]
    RegressionLimit { job_id: String, limit: u32 },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Awakeable(#[from] AwakeableError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("worker panicked: {0}")]
    Worker(String),
}

impl SchedulerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::State(e) => e.is_retryable(),
            SchedulerError::Executor(e) => e.is_retryable(),
            SchedulerError::Awakeable(e) => e.is_retryable(),
            SchedulerError::Repository(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Where a call to `run` left the job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
    Suspended,
    BackingOff { next_retry_at: DateTime<Utc> },
    Cancelled,
}

impl JobOutcome {
    /// Outcome recorded on a completed job.
    fn of_completed(job: &Job) -> Self {
        if job.is_cancelled() {
            JobOutcome::Cancelled
        } else if job.succeeded() {
            JobOutcome::Completed
        } else {
            JobOutcome::Failed {
                reason: job.completion_failure.clone().unwrap_or_default(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on tasks executing at once, across all jobs.
    pub max_concurrency: usize,
    pub defaults: DefinitionDefaults,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            defaults: DefinitionDefaults::default(),
        }
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            defaults: DefinitionDefaults {
                retry: config.default_retry.clone(),
                max_regressions: config.max_regressions,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler<S: DurableStore> {
    store: Arc<S>,
    states: Arc<StateMachine<S>>,
    awakeables: AwakeableManager<S>,
    executor: Arc<TaskExecutor<S>>,
    permits: Arc<Semaphore>,
    config: SchedulerConfig,
}

impl<S: DurableStore> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        bus: EventBus,
        handlers: HandlerRegistry,
        gates: GateRegistry,
        config: SchedulerConfig,
    ) -> Self {
        let states = Arc::new(StateMachine::new(store.clone(), bus));
        let awakeables = AwakeableManager::new(states.clone());
        let executor = Arc::new(TaskExecutor::new(
            states.clone(),
            awakeables.clone(),
            Arc::new(handlers),
            Arc::new(gates),
        ));
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            store,
            states,
            awakeables,
            executor,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn states(&self) -> &Arc<StateMachine<S>> {
        &self.states
    }

    pub fn awakeables(&self) -> &AwakeableManager<S> {
        &self.awakeables
    }

    pub fn bus(&self) -> &EventBus {
        self.states.bus()
    }

    async fn load_job(&self, job_id: &str) -> Result<Job, SchedulerError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Validate and persist a job definition.
    ///
    /// Validation, including cycle detection, finishes before the first
    /// write; a rejected definition leaves the store untouched.
    pub async fn submit(&self, def: &JobDefinition) -> Result<Job, SchedulerError> {
        validate_definition(def, self.executor.handlers(), self.executor.gates())?;
        for dep in &def.depends_on {
            if self.store.get_job(dep).await?.is_none() {
                return Err(DefinitionError::UnknownDependency(format!("job '{dep}'")).into());
            }
        }

        let now = Utc::now();
        let (mut job, tasks) = build_job(def, &self.config.defaults, now);
        let event = Event::new(&job.id, EventType::JobSubmitted)
            .with_payload(Some(format!("{} tasks", tasks.len())));
        match self.store.create_job(&job, &tasks, &event).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => return Err(SchedulerError::AlreadyExists(job.id)),
            Err(e) => return Err(e.into()),
        }
        self.states.bus().publish(event);
        tracing::info!(job_id = %job.id, tasks = tasks.len(), "job submitted");

        if let Some(at) = job.scheduled_start_at.filter(|at| *at > now) {
            self.states
                .transition_job(&mut job, JobStatus::Scheduled, Some(format!("starts at {at}")))
                .await?;
        }
        Ok(job)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Drive the job until no task is ready, then settle its status.
    pub async fn run(&self, job_id: &str) -> Result<JobOutcome, SchedulerError> {
        let mut job = self.load_job(job_id).await?;
        if job.status == JobStatus::Completed {
            return Ok(JobOutcome::of_completed(&job));
        }
        self.check_job_dependencies(&job).await?;
        self.start(&mut job).await?;

        let mut failure: Option<(FailureCode, String)> = None;
        loop {
            let tasks = self.store.list_tasks(job_id).await?;
            let ready: Vec<String> = ready_set(&tasks).into_iter().map(|t| t.name.clone()).collect();
            if ready.is_empty() {
                break;
            }
            tracing::debug!(job_id, ready = ?ready, "dispatching ready tasks");

            let outcomes = self.dispatch(job_id, &ready).await?;
            for (name, outcome) in outcomes {
                match outcome {
                    TaskOutcome::Failed {
                        regress_to: Some(target),
                        error,
                    } => match self.regress(job_id, &target).await {
                        Ok(reset) => {
                            tracing::info!(job_id, task = %name, target = %target, reset = reset.len(), "regressed after failure");
                        }
                        Err(SchedulerError::RegressionLimit { limit, .. }) => {
                            failure = Some((
                                FailureCode::RegressionLimit,
                                format!("task '{name}' failed after {limit} regressions: {error}"),
                            ));
                        }
                        Err(e) => return Err(e),
                    },
                    TaskOutcome::Failed { error, regress_to: None } => {
                        failure.get_or_insert((
                            FailureCode::TaskFailed,
                            format!("task '{name}' failed: {error}"),
                        ));
                    }
                    TaskOutcome::Cancelled => {
                        let job = self.load_job(job_id).await?;
                        if job.status == JobStatus::Completed {
                            return Ok(JobOutcome::of_completed(&job));
                        }
                    }
                    TaskOutcome::Completed(_) | TaskOutcome::Skipped | TaskOutcome::Suspended => {}
                }
            }
            if failure.is_some() {
                break;
            }
        }

        self.settle(job_id, failure).await
    }

    /// Execute `ready` through the shared worker pool. Outcomes come back in
    /// dispatch order.
    async fn dispatch(
        &self,
        job_id: &str,
        ready: &[String],
    ) -> Result<Vec<(String, TaskOutcome)>, SchedulerError> {
        let mut set = JoinSet::new();
        for name in ready {
            let executor = self.executor.clone();
            let permits = self.permits.clone();
            let job_id = job_id.to_string();
            let name = name.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = executor.execute(&job_id, &name).await;
                (name, result)
            });
        }

        let mut results = HashMap::new();
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(outcome))) => {
                    results.insert(name, outcome);
                }
                Ok((name, Err(e))) => {
                    tracing::error!(job_id, task = %name, error = %e, "task execution error");
                    first_error.get_or_insert(SchedulerError::Executor(e));
                }
                Err(e) => {
                    first_error.get_or_insert(SchedulerError::Worker(e.to_string()));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(ready
            .iter()
            .filter_map(|name| results.remove(name).map(|o| (name.clone(), o)))
            .collect())
    }

    async fn check_job_dependencies(&self, job: &Job) -> Result<(), SchedulerError> {
        let mut pending = Vec::new();
        for dep in &job.depends_on {
            match self.store.get_job(dep).await? {
                Some(upstream) if upstream.succeeded() => {}
                _ => pending.push(dep.clone()),
            }
        }
        if pending.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::DependenciesUnmet {
                job_id: job.id.clone(),
                pending,
            })
        }
    }

    /// Walk the job to running through legal transitions.
    async fn start(&self, job: &mut Job) -> Result<(), SchedulerError> {
        loop {
            let next = match job.status {
                JobStatus::Running => return Ok(()),
                JobStatus::Pending => JobStatus::Ready,
                JobStatus::Scheduled => {
                    if let Some(at) = job.scheduled_start_at.filter(|at| *at > Utc::now()) {
                        return Err(SchedulerError::NotDue {
                            job_id: job.id.clone(),
                            at,
                        });
                    }
                    JobStatus::Ready
                }
                JobStatus::Ready
                | JobStatus::Suspended
                | JobStatus::BackingOff
                | JobStatus::Paused => JobStatus::Running,
                JobStatus::Completed => {
                    return Err(SchedulerError::NotRunnable {
                        job_id: job.id.clone(),
                        status: job.status,
                    });
                }
            };
            if job.status == JobStatus::BackingOff {
                job.next_retry_at = None;
            }
            self.states.transition_job(job, next, None).await?;
        }
    }

    /// Settle the job after the dispatch loop stops.
    async fn settle(
        &self,
        job_id: &str,
        failure: Option<(FailureCode, String)>,
    ) -> Result<JobOutcome, SchedulerError> {
        let mut job = self.load_job(job_id).await?;
        if job.status == JobStatus::Completed {
            return Ok(JobOutcome::of_completed(&job));
        }
        let tasks = self.store.list_tasks(job_id).await?;

        let failure = failure.or_else(|| {
            tasks
                .iter()
                .find(|t| t.status == TaskStatus::Failed)
                .map(|t| {
                    (
                        FailureCode::TaskFailed,
                        format!("task '{}' failed: {}", t.name, t.error.as_deref().unwrap_or("")),
                    )
                })
        });
        if let Some((code, reason)) = failure {
            return self.fail(&mut job, &tasks, code, reason).await;
        }

        if tasks.iter().all(|t| t.status.is_settled()) {
            self.states
                .complete_job(&mut job, CompletionResult::Success, None)
                .await?;
            return Ok(JobOutcome::Completed);
        }
        if tasks.iter().any(|t| t.status == TaskStatus::Suspended) {
            self.states
                .transition_job(&mut job, JobStatus::Suspended, None)
                .await?;
            tracing::info!(job_id, "job suspended");
            return Ok(JobOutcome::Suspended);
        }

        let stuck: Vec<&str> = tasks
            .iter()
            .filter(|t| !t.status.is_settled())
            .map(|t| t.name.as_str())
            .collect();
        let reason = format!("no runnable tasks, unfinished: {}", stuck.join(", "));
        self.fail(&mut job, &tasks, FailureCode::Deadlock, reason).await
    }

    /// Fail a running job: back off if retries remain, otherwise complete it
    /// with a failure result.
    async fn fail(
        &self,
        job: &mut Job,
        tasks: &[Task],
        code: FailureCode,
        reason: String,
    ) -> Result<JobOutcome, SchedulerError> {
        if job.retry_count < job.max_retries {
            let mut next = job.clone();
            next.retry_count += 1;
            let at = RetryHandler::next_retry_at(
                Utc::now(),
                next.retry_count,
                next.retry_delay_ms,
                next.retry_scaling,
            );
            next.next_retry_at = Some(at);
            next.last_failure = Some(reason.clone());
            next.last_failure_code = Some(code.as_str().to_string());

            let mut batch = WriteBatch::default();
            self.states
                .stage_job(&mut batch, &mut next, JobStatus::BackingOff, Some(reason.clone()))?;
            for task in tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
                let mut task = task.clone();
                task.clear_run_state();
                task.replay = false;
                self.states.stage_task(
                    &mut batch,
                    &mut task,
                    TaskStatus::Pending,
                    Some("reset for job retry".into()),
                )?;
            }
            self.states.commit(batch).await?;
            tracing::warn!(
                job_id = %job.id,
                retry = next.retry_count,
                max_retries = next.max_retries,
                next_retry_at = %at,
                reason = %reason,
                "job failed, backing off"
            );
            *job = next;
            return Ok(JobOutcome::BackingOff { next_retry_at: at });
        }

        self.states
            .complete_job(job, CompletionResult::Failure, Some((code, reason.clone())))
            .await?;
        tracing::warn!(job_id = %job.id, code = code.as_str(), reason = %reason, "job failed");
        Ok(JobOutcome::Failed { reason })
    }

    // -----------------------------------------------------------------------
    // Regression
    // -----------------------------------------------------------------------

    /// Reset `target` and everything downstream of it to pending.
    ///
    /// Returns the names reset. Counts against the job's `max_regressions`.
    pub async fn regress(&self, job_id: &str, target: &str) -> Result<Vec<String>, SchedulerError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut job = self.load_job(job_id).await?;
            if job.status == JobStatus::Completed {
                return Err(SchedulerError::NotRunnable {
                    job_id: job_id.to_string(),
                    status: job.status,
                });
            }
            if job.regression_count >= job.max_regressions {
                return Err(SchedulerError::RegressionLimit {
                    job_id: job_id.to_string(),
                    limit: job.max_regressions,
                });
            }
            let tasks = self.store.list_tasks(job_id).await?;
            if !tasks.iter().any(|t| t.name == target) {
                return Err(SchedulerError::UnknownTask {
                    job_id: job_id.to_string(),
                    task: target.to_string(),
                });
            }
            let scope = TaskGraph::from_tasks(&tasks)?.downstream_inclusive(target);

            let mut batch = WriteBatch::default();
            let mut reset = Vec::new();
            for task in tasks.iter().filter(|t| scope.contains(&t.name)) {
                if task.status == TaskStatus::Cancelled {
                    continue;
                }
                let mut task = task.clone();
                task.clear_run_state();
                task.replay = false;
                if task.status == TaskStatus::Pending {
                    self.states.stage_task_update(&mut batch, &mut task);
                } else {
                    self.states.stage_task(
                        &mut batch,
                        &mut task,
                        TaskStatus::Pending,
                        Some(format!("regressed to '{target}'")),
                    )?;
                }
                batch.events.push(
                    Event::new(job_id, EventType::TaskRegressed)
                        .for_task(&task.name)
                        .with_payload(Some(target.to_string())),
                );
                reset.push(task.name);
            }

            let owned: HashSet<&str> = reset.iter().map(String::as_str).collect();
            for awakeable in self
                .store
                .list_awakeables(Some(job_id), Some(AwakeableStatus::Pending))
                .await?
                .iter()
                .filter(|a| owned.contains(a.task_name.as_str()))
            {
                stage_cancel(&mut batch, awakeable);
            }

            job.regression_count += 1;
            self.states.stage_job_update(&mut batch, &mut job);

            match self.states.commit(batch).await {
                Ok(()) => {
                    tracing::info!(
                        job_id,
                        target,
                        regression = job.regression_count,
                        reset = ?reset,
                        "job regressed"
                    );
                    return Ok(reset);
                }
                Err(StateError::Conflict(reason)) => {
                    tracing::debug!(job_id, %reason, "regression lost race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict(format!("regression of job '{job_id}' kept losing races")).into())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Crash recovery: re-queue tasks left running so their next start
    /// replays the interrupted invocation, then run the job.
    pub async fn resume(&self, job_id: &str) -> Result<JobOutcome, SchedulerError> {
        let job = self.load_job(job_id).await?;
        if job.status == JobStatus::Completed {
            return Ok(JobOutcome::of_completed(&job));
        }

        let mut batch = WriteBatch::default();
        for task in self.store.list_tasks(job_id).await? {
            if task.status != TaskStatus::Running {
                continue;
            }
            let mut task = task;
            task.clear_run_state();
            task.replay = true;
            let reason = Some(format!("resuming invocation {}", task.invocation));
            self.states
                .stage_task(&mut batch, &mut task, TaskStatus::Pending, reason)?;
        }
        if !batch.tasks.is_empty() {
            tracing::info!(job_id, tasks = batch.tasks.len(), "re-queued interrupted tasks");
        }
        self.states.commit(batch).await?;
        self.run(job_id).await
    }

    /// Resume every job left running, e.g. at startup.
    pub async fn resume_all(&self) -> Result<Vec<(String, JobOutcome)>, SchedulerError> {
        let mut outcomes = Vec::new();
        for job in self.store.list_jobs(Some(JobStatus::Running)).await? {
            match self.resume(&job.id).await {
                Ok(outcome) => outcomes.push((job.id, outcome)),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "failed to resume job");
                }
            }
        }
        Ok(outcomes)
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Cancel a job: unfinished tasks are cancelled, pending awakeables are
    /// cancelled and the job completes with a failure. Journaled effects are
    /// not undone.
    pub async fn cancel(&self, job_id: &str) -> Result<JobOutcome, SchedulerError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut job = self.load_job(job_id).await?;
            if job.status == JobStatus::Completed {
                return Ok(JobOutcome::of_completed(&job));
            }

            let mut batch = WriteBatch::default();
            self.states.stage_force_complete(
                &mut batch,
                &mut job,
                FailureCode::Cancelled,
                CANCELLED_REASON,
            )?;
            for task in self.store.list_tasks(job_id).await? {
                if matches!(
                    task.status,
                    TaskStatus::Pending | TaskStatus::Running | TaskStatus::Suspended
                ) {
                    let mut task = task;
                    self.states.stage_task(
                        &mut batch,
                        &mut task,
                        TaskStatus::Cancelled,
                        Some(CANCELLED_REASON.to_string()),
                    )?;
                }
            }
            for awakeable in self
                .store
                .list_awakeables(Some(job_id), Some(AwakeableStatus::Pending))
                .await?
            {
                stage_cancel(&mut batch, &awakeable);
            }

            match self.states.commit(batch).await {
                Ok(()) => {
                    tracing::info!(job_id, "job cancelled");
                    return Ok(JobOutcome::Cancelled);
                }
                Err(StateError::Conflict(reason)) => {
                    tracing::debug!(job_id, %reason, "cancel lost race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict(format!("cancel of job '{job_id}' kept losing races")).into())
    }

    /// Hold a backing-off job so the retry sweep leaves it alone.
    pub async fn pause(&self, job_id: &str) -> Result<Job, SchedulerError> {
        let mut job = self.load_job(job_id).await?;
        self.states
            .transition_job(&mut job, JobStatus::Paused, Some("paused by operator".into()))
            .await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryStore;
    use crate::workflow::handler::{TaskContext, TaskError};
    use crate::workflow::testing::{echo_registry, gates, t};
    use nuoc_types::task::RetryPolicy;
    use serde_json::json;
    use std::sync::Mutex;

    fn scheduler(handlers: HandlerRegistry) -> Scheduler<InMemoryStore> {
        Scheduler::new(
            Arc::new(InMemoryStore::new()),
            EventBus::default(),
            handlers,
            gates(),
            SchedulerConfig::default(),
        )
    }

    fn once() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            delay_ms: 1,
            scaling_factor: 1.0,
        }
    }

    #[tokio::test]
    async fn test_priority_orders_dispatch_within_a_level() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("echo", move |ctx: TaskContext| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(ctx.task_name().to_string());
                Ok(json!(null))
            }
        });
        let sched = Scheduler::new(
            Arc::new(InMemoryStore::new()),
            EventBus::default(),
            handlers,
            gates(),
            SchedulerConfig {
                max_concurrency: 1,
                ..SchedulerConfig::default()
            },
        );
        let mut low = t("low", &[]);
        low.priority = 1;
        let mut high = t("high", &[]);
        high.priority = 5;
        let def = JobDefinition::new("j", vec![low, t("mid", &[]), high]);
        sched.submit(&def).await.unwrap();

        assert_eq!(sched.run("j").await.unwrap(), JobOutcome::Completed);
        assert_eq!(*order.lock().unwrap(), vec!["high", "low", "mid"]);
    }

    #[tokio::test]
    async fn test_future_start_is_scheduled_and_not_due() {
        let sched = scheduler(echo_registry());
        let mut def = JobDefinition::new("later", vec![t("a", &[])]);
        def.scheduled_start_at = Some(Utc::now() + chrono::Duration::hours(1));

        let job = sched.submit(&def).await.unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);

        let err = sched.run("later").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotDue { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected() {
        let sched = scheduler(echo_registry());
        let def = JobDefinition::new("j", vec![t("a", &[])]);
        sched.submit(&def).await.unwrap();
        let err = sched.submit(&def).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyExists(id) if id == "j"));
    }

    #[tokio::test]
    async fn test_job_dependencies_gate_run() {
        let sched = scheduler(echo_registry());
        sched
            .submit(&JobDefinition::new("first", vec![t("a", &[])]))
            .await
            .unwrap();
        let mut second = JobDefinition::new("second", vec![t("a", &[])]);
        second.depends_on = vec!["first".to_string()];
        sched.submit(&second).await.unwrap();

        let err = sched.run("second").await.unwrap_err();
        assert!(matches!(err, SchedulerError::DependenciesUnmet { ref pending, .. } if pending == &["first"]));

        sched.run("first").await.unwrap();
        assert_eq!(sched.run("second").await.unwrap(), JobOutcome::Completed);
    }

    #[tokio::test]
    async fn test_unknown_job_dependency_rejected() {
        let sched = scheduler(echo_registry());
        let mut def = JobDefinition::new("j", vec![t("a", &[])]);
        def.depends_on = vec!["ghost".to_string()];
        let err = sched.submit(&def).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Definition(DefinitionError::UnknownDependency(_))));
        assert!(sched.store().get_job("j").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_dependency_deadlock_is_failure() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("echo", |ctx: TaskContext| async move {
            if ctx.task_name() == "a" {
                Err(TaskError::failed("boom"))
            } else {
                Ok(json!(null))
            }
        });
        let sched = scheduler(handlers);
        let def = JobDefinition::new("j", vec![t("a", &[]).retry(once()), t("b", &["a"])]);
        sched.submit(&def).await.unwrap();

        let outcome = sched.run("j").await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                reason: "task 'a' failed: boom".to_string()
            }
        );
        let job = sched.store().get_job("j").await.unwrap().unwrap();
        assert_eq!(job.last_failure_code.as_deref(), Some("task_failed"));
        let b = sched.store().get_task("j", "b").await.unwrap().unwrap();
        assert_eq!(b.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_job_retry_resets_failed_work_and_completes() {
        let calls = Arc::new(Mutex::new(0u32));
        let seen = calls.clone();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("echo", move |ctx: TaskContext| {
            let seen = seen.clone();
            async move {
                if ctx.task_name() == "a" {
                    let mut n = seen.lock().unwrap();
                    *n += 1;
                    if *n == 1 {
                        return Err(TaskError::failed("flaky"));
                    }
                }
                Ok(json!(ctx.task_name()))
            }
        });
        let sched = scheduler(handlers);
        let mut def = JobDefinition::new(
            "j",
            vec![t("a", &[]).retry(once()), t("b", &["a"]), t("c", &["b"])],
        );
        def.max_retries = 1;
        def.retry_delay_ms = Some(1);
        sched.submit(&def).await.unwrap();

        let outcome = sched.run("j").await.unwrap();
        assert!(matches!(outcome, JobOutcome::BackingOff { .. }));
        let tasks = sched.store().list_tasks("j").await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));

        assert_eq!(sched.run("j").await.unwrap(), JobOutcome::Completed);
        let job = sched.store().get_job("j").await.unwrap().unwrap();
        assert!(job.succeeded());
        assert_eq!(job.retry_count, 1);
        let tasks = sched.store().list_tasks("j").await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_regression_limit_fails_job() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("echo", |ctx: TaskContext| async move {
            if ctx.task_name() == "verify" {
                Err(TaskError::failed("still broken"))
            } else {
                Ok(json!("built"))
            }
        });
        let sched = scheduler(handlers);
        let mut def = JobDefinition::new(
            "j",
            vec![
                t("build", &[]),
                t("verify", &["build"]).retry(once()).regress_to("build"),
            ],
        );
        def.max_regressions = Some(2);
        sched.submit(&def).await.unwrap();

        let outcome = sched.run("j").await.unwrap();

        assert!(matches!(outcome, JobOutcome::Failed { ref reason } if reason.contains("2 regressions")));
        let job = sched.store().get_job("j").await.unwrap().unwrap();
        assert_eq!(job.regression_count, 2);
        assert_eq!(job.last_failure_code.as_deref(), Some("regression_limit"));
    }

    #[tokio::test]
    async fn test_manual_regress_requires_known_task() {
        let sched = scheduler(echo_registry());
        sched
            .submit(&JobDefinition::new("j", vec![t("a", &[])]))
            .await
            .unwrap();
        let err = sched.regress("j", "zzz").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTask { .. }));
    }

    #[tokio::test]
    async fn test_pause_only_from_backing_off() {
        let sched = scheduler(echo_registry());
        sched
            .submit(&JobDefinition::new("j", vec![t("a", &[])]))
            .await
            .unwrap();
        let err = sched.pause("j").await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::State(StateError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_on_completed_job_reports_stored_outcome() {
        let sched = scheduler(echo_registry());
        sched
            .submit(&JobDefinition::new("j", vec![t("a", &[])]))
            .await
            .unwrap();
        assert_eq!(sched.run("j").await.unwrap(), JobOutcome::Completed);
        assert_eq!(sched.run("j").await.unwrap(), JobOutcome::Completed);
        assert_eq!(sched.cancel("j").await.unwrap(), JobOutcome::Completed);
    }
}
