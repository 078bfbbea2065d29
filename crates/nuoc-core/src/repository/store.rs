//! Durable store trait definition.
//!
//! Every persisted entity of the engine goes through this interface. Status
//! changes are expressed as a `WriteBatch` that the store applies in one
//! transaction, with a compare-and-set on the prior status of every row it
//! touches.

use std::future::Future;

use chrono::{DateTime, Utc};
use nuoc_types::awakeable::{Awakeable, AwakeableId, AwakeableStatus};
use nuoc_types::error::RepositoryError;
use nuoc_types::event::Event;
use nuoc_types::job::{Job, JobStatus};
use nuoc_types::journal::{ExecutionContext, InvocationKey, JournalEntry};
use nuoc_types::task::{Task, TaskStatus};

/// Replace a job row, provided it still has status `expected`.
#[derive(Debug, Clone)]
pub struct JobWrite {
    pub job: Job,
    pub expected: JobStatus,
}

/// Replace a task row, provided it still has status `expected`.
#[derive(Debug, Clone)]
pub struct TaskWrite {
    pub task: Task,
    pub expected: TaskStatus,
}

/// Replace an awakeable row, provided it still has status `expected`.
#[derive(Debug, Clone)]
pub struct AwakeableWrite {
    pub awakeable: Awakeable,
    pub expected: AwakeableStatus,
}

/// Status assertion that writes nothing.
#[derive(Debug, Clone)]
pub enum Guard {
    Task {
        job_id: String,
        name: String,
        status: TaskStatus,
    },
    Awakeable {
        id: AwakeableId,
        status: AwakeableStatus,
    },
}

/// A set of writes applied atomically.
///
/// If any guard or expected status does not match, nothing is written and
/// the store returns `RepositoryError::Conflict` (or `NotFound` when the row
/// does not exist).
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub jobs: Vec<JobWrite>,
    pub tasks: Vec<TaskWrite>,
    pub awakeables: Vec<AwakeableWrite>,
    pub guards: Vec<Guard>,
    pub events: Vec<Event>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
            && self.tasks.is_empty()
            && self.awakeables.is_empty()
            && self.events.is_empty()
    }
}

/// Storage trait for jobs, tasks, the journal, awakeables and events.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DurableStore: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Jobs and tasks
    // -----------------------------------------------------------------------

    /// Insert a job with its tasks, task dependencies and job dependencies.
    ///
    /// Returns `Conflict` if a job with the same id exists.
    fn create_job(
        &self,
        job: &Job,
        tasks: &[Task],
        event: &Event,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job(&self, id: &str)
    -> impl Future<Output = Result<Option<Job>, RepositoryError>> + Send;

    /// Jobs ordered by position, then creation time.
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
    ) -> impl Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    fn get_task(
        &self,
        job_id: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// Tasks of a job in definition order.
    fn list_tasks(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Apply a batch of guarded writes in one transaction.
    fn commit(&self, batch: &WriteBatch)
    -> impl Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Journal
    // -----------------------------------------------------------------------

    /// Append one entry. Returns `Conflict` if the key is taken.
    fn append_journal(
        &self,
        entry: &JournalEntry,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_journal_entry(
        &self,
        key: &InvocationKey,
        entry_index: u32,
    ) -> impl Future<Output = Result<Option<JournalEntry>, RepositoryError>> + Send;

    fn count_journal_entries(
        &self,
        key: &InvocationKey,
    ) -> impl Future<Output = Result<u32, RepositoryError>> + Send;

    /// Entries of one invocation ordered by index.
    fn list_journal(
        &self,
        key: &InvocationKey,
    ) -> impl Future<Output = Result<Vec<JournalEntry>, RepositoryError>> + Send;

    /// Insert or replace the replay cursor of an invocation.
    fn save_context(
        &self,
        ctx: &ExecutionContext,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_context(
        &self,
        key: &InvocationKey,
    ) -> impl Future<Output = Result<Option<ExecutionContext>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Awakeables
    // -----------------------------------------------------------------------

    /// Insert a new awakeable and its creation event. `Conflict` on duplicate id.
    fn insert_awakeable(
        &self,
        awakeable: &Awakeable,
        event: &Event,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_awakeable(
        &self,
        id: &AwakeableId,
    ) -> impl Future<Output = Result<Option<Awakeable>, RepositoryError>> + Send;

    /// Awakeables filtered by owning job and/or status.
    fn list_awakeables(
        &self,
        job_id: Option<&str>,
        status: Option<AwakeableStatus>,
    ) -> impl Future<Output = Result<Vec<Awakeable>, RepositoryError>> + Send;

    /// Pending awakeables whose timeout is at or before `now`.
    fn list_expired_awakeables(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Awakeable>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Events of a job in the order they were written.
    fn list_events(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<Event>, RepositoryError>> + Send;

    /// Cheap liveness probe of the underlying storage.
    fn health_check(&self) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}
