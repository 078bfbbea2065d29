//! In-memory `DurableStore`.
//!
//! Keeps every entity behind one mutex, so a `WriteBatch` is checked and
//! applied under a single lock and is atomic like the SQLite transaction.
//! Used by engine tests and by embedders that do not need durability.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use nuoc_types::awakeable::{Awakeable, AwakeableId, AwakeableStatus};
use nuoc_types::error::RepositoryError;
use nuoc_types::event::Event;
use nuoc_types::job::{Job, JobStatus};
use nuoc_types::journal::{ExecutionContext, InvocationKey, JournalEntry};
use nuoc_types::task::Task;

use super::store::{DurableStore, Guard, WriteBatch};

type JournalKey = (String, String, u32, u32);
type ContextKey = (String, String, u32);

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, Job>,
    /// Tasks per job in definition order.
    tasks: HashMap<String, Vec<Task>>,
    journal: BTreeMap<JournalKey, JournalEntry>,
    contexts: HashMap<ContextKey, ExecutionContext>,
    awakeables: HashMap<String, Awakeable>,
    events: Vec<Event>,
}

impl MemoryState {
    fn task(&self, job_id: &str, name: &str) -> Option<&Task> {
        self.tasks.get(job_id)?.iter().find(|t| t.name == name)
    }

    fn task_mut(&mut self, job_id: &str, name: &str) -> Option<&mut Task> {
        self.tasks.get_mut(job_id)?.iter_mut().find(|t| t.name == name)
    }

    /// Checks every precondition of `batch` without modifying anything.
    fn check(&self, batch: &WriteBatch) -> Result<(), RepositoryError> {
        for write in &batch.jobs {
            let current = self.jobs.get(&write.job.id).ok_or(RepositoryError::NotFound)?;
            if current.status != write.expected {
                return Err(RepositoryError::Conflict(format!(
                    "job '{}' is {}, expected {}",
                    write.job.id, current.status, write.expected
                )));
            }
        }
        for write in &batch.tasks {
            let current = self
                .task(&write.task.job_id, &write.task.name)
                .ok_or(RepositoryError::NotFound)?;
            if current.status != write.expected {
                return Err(RepositoryError::Conflict(format!(
                    "task '{}/{}' is {}, expected {}",
                    write.task.job_id, write.task.name, current.status, write.expected
                )));
            }
        }
        for write in &batch.awakeables {
            let current = self
                .awakeables
                .get(write.awakeable.id.as_str())
                .ok_or(RepositoryError::NotFound)?;
            if current.status != write.expected {
                return Err(RepositoryError::Conflict(format!(
                    "awakeable '{}' is {}, expected {}",
                    write.awakeable.id, current.status, write.expected
                )));
            }
        }
        for guard in &batch.guards {
            match guard {
                Guard::Task {
                    job_id,
                    name,
                    status,
                } => {
                    let current = self.task(job_id, name).ok_or(RepositoryError::NotFound)?;
                    if current.status != *status {
                        return Err(RepositoryError::Conflict(format!(
                            "task '{job_id}/{name}' is {}, expected {status}",
                            current.status
                        )));
                    }
                }
                Guard::Awakeable { id, status } => {
                    let current = self
                        .awakeables
                        .get(id.as_str())
                        .ok_or(RepositoryError::NotFound)?;
                    if current.status != *status {
                        return Err(RepositoryError::Conflict(format!(
                            "awakeable '{id}' is {}, expected {status}",
                            current.status
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Thread-safe in-memory store. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `RepositoryError::Unavailable`
    /// until switched back. Simulates an unreachable database.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(
                "in-memory store switched off".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("store lock poisoned".to_string()))
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

fn journal_key(key: &InvocationKey, entry_index: u32) -> JournalKey {
    (
        key.job_id.clone(),
        key.task_name.clone(),
        key.attempt,
        entry_index,
    )
}

fn context_key(key: &InvocationKey) -> ContextKey {
    (key.job_id.clone(), key.task_name.clone(), key.attempt)
}

impl DurableStore for InMemoryStore {
    async fn create_job(&self, job: &Job, tasks: &[Task], event: &Event) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.jobs.contains_key(&job.id) {
            return Err(RepositoryError::Conflict(format!(
                "job '{}' already exists",
                job.id
            )));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        state.tasks.insert(job.id.clone(), tasks.to_vec());
        state.events.push(event.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, RepositoryError> {
        Ok(self.lock()?.jobs.get(id).cloned())
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, RepositoryError> {
        let state = self.lock()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    async fn get_task(&self, job_id: &str, name: &str) -> Result<Option<Task>, RepositoryError> {
        Ok(self.lock()?.task(job_id, name).cloned())
    }

    async fn list_tasks(&self, job_id: &str) -> Result<Vec<Task>, RepositoryError> {
        Ok(self.lock()?.tasks.get(job_id).cloned().unwrap_or_default())
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        state.check(batch)?;

        for write in &batch.jobs {
            state.jobs.insert(write.job.id.clone(), write.job.clone());
        }
        for write in &batch.tasks {
            if let Some(task) = state.task_mut(&write.task.job_id, &write.task.name) {
                *task = write.task.clone();
            }
        }
        for write in &batch.awakeables {
            state.awakeables.insert(
                write.awakeable.id.as_str().to_string(),
                write.awakeable.clone(),
            );
        }
        state.events.extend(batch.events.iter().cloned());
        Ok(())
    }

    async fn append_journal(&self, entry: &JournalEntry) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let key = (
            entry.job_id.clone(),
            entry.task_name.clone(),
            entry.attempt,
            entry.entry_index,
        );
        if state.journal.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "journal entry {}/{}/{}#{} already exists",
                entry.job_id, entry.task_name, entry.attempt, entry.entry_index
            )));
        }
        state.journal.insert(key, entry.clone());
        Ok(())
    }

    async fn get_journal_entry(
        &self,
        key: &InvocationKey,
        entry_index: u32,
    ) -> Result<Option<JournalEntry>, RepositoryError> {
        Ok(self.lock()?.journal.get(&journal_key(key, entry_index)).cloned())
    }

    async fn count_journal_entries(&self, key: &InvocationKey) -> Result<u32, RepositoryError> {
        let state = self.lock()?;
        let count = state
            .journal
            .range(journal_key(key, 0)..=journal_key(key, u32::MAX))
            .count();
        Ok(count as u32)
    }

    async fn list_journal(&self, key: &InvocationKey) -> Result<Vec<JournalEntry>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .journal
            .range(journal_key(key, 0)..=journal_key(key, u32::MAX))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn save_context(&self, ctx: &ExecutionContext) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        state.contexts.insert(context_key(&ctx.key()), ctx.clone());
        Ok(())
    }

    async fn get_context(&self, key: &InvocationKey) -> Result<Option<ExecutionContext>, RepositoryError> {
        Ok(self.lock()?.contexts.get(&context_key(key)).cloned())
    }

    async fn insert_awakeable(&self, awakeable: &Awakeable, event: &Event) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.awakeables.contains_key(awakeable.id.as_str()) {
            return Err(RepositoryError::Conflict(format!(
                "awakeable '{}' already exists",
                awakeable.id
            )));
        }
        state
            .awakeables
            .insert(awakeable.id.as_str().to_string(), awakeable.clone());
        state.events.push(event.clone());
        Ok(())
    }

    async fn get_awakeable(&self, id: &AwakeableId) -> Result<Option<Awakeable>, RepositoryError> {
        Ok(self.lock()?.awakeables.get(id.as_str()).cloned())
    }

    async fn list_awakeables(
        &self,
        job_id: Option<&str>,
        status: Option<AwakeableStatus>,
    ) -> Result<Vec<Awakeable>, RepositoryError> {
        let state = self.lock()?;
        let mut found: Vec<Awakeable> = state
            .awakeables
            .values()
            .filter(|a| job_id.is_none_or(|j| a.job_id == j))
            .filter(|a| status.is_none_or(|s| a.status == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.as_str().cmp(b.id.as_str())));
        Ok(found)
    }

    async fn list_expired_awakeables(&self, now: DateTime<Utc>) -> Result<Vec<Awakeable>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .awakeables
            .values()
            .filter(|a| a.status == AwakeableStatus::Pending)
            .filter(|a| a.timeout_at.is_some_and(|t| t <= now))
            .cloned()
            .collect())
    }

    async fn list_events(&self, job_id: &str) -> Result<Vec<Event>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        self.lock().map(|_| ())
    }
}
