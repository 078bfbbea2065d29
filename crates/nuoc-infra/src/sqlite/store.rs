//! SQLite implementation of `DurableStore`.
//!
//! Reads use the reader pool. Every write runs in a transaction on the
//! single writer connection; status changes are `UPDATE ... WHERE status = ?`
//! and a missed update rolls the whole batch back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use nuoc_core::repository::{AwakeableWrite, DurableStore, Guard, JobWrite, TaskWrite, WriteBatch};
use nuoc_types::awakeable::{Awakeable, AwakeableId, AwakeableStatus};
use nuoc_types::error::RepositoryError;
use nuoc_types::event::Event;
use nuoc_types::job::{Job, JobStatus};
use nuoc_types::journal::{ExecutionContext, InvocationKey, JournalEntry};
use nuoc_types::task::Task;
use sqlx::{Row, SqliteConnection};

use super::pool::DatabasePool;
use super::rows::{
    awakeable_from_row, context_from_row, event_from_row, format_datetime, job_from_row,
    journal_from_row, map_sqlx, task_from_row, to_json,
};

/// SQLite-backed `DurableStore`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open the database at `database_url`, running migrations.
    pub async fn open(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = DatabasePool::new(database_url).await.map_err(|e| match e {
            sqlx::Error::Migrate(m) => RepositoryError::Query(format!("migration failed: {m}")),
            other => match map_sqlx(other) {
                RepositoryError::Query(msg) => RepositoryError::Connection(msg),
                mapped => mapped,
            },
        })?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    async fn job_deps(&self, job_id: Option<&str>) -> Result<HashMap<String, Vec<String>>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT job_id, depends_on FROM job_deps WHERE (?1 IS NULL OR job_id = ?1) ORDER BY job_id, rowid",
        )
        .bind(job_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        group_pairs(&rows, "job_id", "depends_on")
    }

    async fn task_deps(
        &self,
        job_id: &str,
        task_name: Option<&str>,
    ) -> Result<HashMap<String, Vec<String>>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT task_name, depends_on FROM task_deps
             WHERE job_id = ?1 AND (?2 IS NULL OR task_name = ?2)
             ORDER BY task_name, seq",
        )
        .bind(job_id)
        .bind(task_name)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        group_pairs(&rows, "task_name", "depends_on")
    }
}

fn group_pairs(
    rows: &[sqlx::sqlite::SqliteRow],
    key: &str,
    value: &str,
) -> Result<HashMap<String, Vec<String>>, RepositoryError> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        let k: String = row.try_get(key).map_err(map_sqlx)?;
        let v: String = row.try_get(value).map_err(map_sqlx)?;
        grouped.entry(k).or_default().push(v);
    }
    Ok(grouped)
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

async fn insert_event(conn: &mut SqliteConnection, event: &Event) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO events (id, job_id, task_name, event_type, old_state, new_state, payload, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.id.to_string())
    .bind(&event.job_id)
    .bind(&event.task_name)
    .bind(event.event_type.as_str())
    .bind(&event.old_state)
    .bind(&event.new_state)
    .bind(&event.payload)
    .bind(format_datetime(&event.created_at))
    .execute(conn)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

async fn insert_task(conn: &mut SqliteConnection, task: &Task, seq: usize) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO tasks (job_id, name, seq, status, handler, params, var, gate, condition,
                            regress_to, priority, attempt, max_attempts, retry_delay_ms,
                            retry_scaling, invocation, replay, output, error, started_at,
                            completed_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.job_id)
    .bind(&task.name)
    .bind(seq as i64)
    .bind(task.status.as_str())
    .bind(&task.handler)
    .bind(to_json(&task.params)?)
    .bind(&task.var)
    .bind(&task.gate)
    .bind(task.condition.as_ref().map(to_json).transpose()?)
    .bind(&task.regress_to)
    .bind(task.priority)
    .bind(task.attempt as i64)
    .bind(task.max_attempts as i64)
    .bind(task.retry_delay_ms as i64)
    .bind(task.retry_scaling)
    .bind(task.invocation as i64)
    .bind(task.replay)
    .bind(task.output.as_ref().map(to_json).transpose()?)
    .bind(&task.error)
    .bind(task.started_at.as_ref().map(format_datetime))
    .bind(task.completed_at.as_ref().map(format_datetime))
    .bind(format_datetime(&task.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx)?;

    for (i, dep) in task.depends_on.iter().enumerate() {
        sqlx::query("INSERT INTO task_deps (job_id, task_name, depends_on, seq) VALUES (?, ?, ?, ?)")
            .bind(&task.job_id)
            .bind(&task.name)
            .bind(dep)
            .bind(i as i64)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;
    }
    Ok(())
}

async fn current_status(
    conn: &mut SqliteConnection,
    select_status: &str,
    keys: &[&str],
) -> Result<Option<String>, RepositoryError> {
    let mut query = sqlx::query_scalar::<_, String>(select_status);
    for key in keys {
        query = query.bind(*key);
    }
    query.fetch_optional(conn).await.map_err(map_sqlx)
}

/// Turn a zero-row CAS update into `NotFound` or `Conflict`.
async fn cas_missed(
    conn: &mut SqliteConnection,
    select_status: &str,
    keys: &[&str],
    what: &str,
    expected: &str,
) -> RepositoryError {
    match current_status(conn, select_status, keys).await {
        Ok(None) => RepositoryError::NotFound,
        Ok(Some(actual)) => {
            RepositoryError::Conflict(format!("{what} is {actual}, expected {expected}"))
        }
        Err(e) => e,
    }
}

async fn update_job(conn: &mut SqliteConnection, write: &JobWrite) -> Result<(), RepositoryError> {
    let job = &write.job;
    let result = sqlx::query(
        "UPDATE jobs SET status = ?, position = ?, external_id = ?, scheduled_start_at = ?,
                completion_result = ?, completion_failure = ?, retry_count = ?, max_retries = ?,
                retry_delay_ms = ?, retry_scaling = ?, next_retry_at = ?, last_failure = ?,
                last_failure_code = ?, regression_count = ?, max_regressions = ?,
                started_at = ?, completed_at = ?, updated_at = ?
         WHERE id = ? AND status = ?",
    )
    .bind(job.status.as_str())
    .bind(job.position)
    .bind(&job.external_id)
    .bind(job.scheduled_start_at.as_ref().map(format_datetime))
    .bind(job.completion_result.map(|r| r.as_str()))
    .bind(&job.completion_failure)
    .bind(job.retry_count as i64)
    .bind(job.max_retries as i64)
    .bind(job.retry_delay_ms as i64)
    .bind(job.retry_scaling)
    .bind(job.next_retry_at.as_ref().map(format_datetime))
    .bind(&job.last_failure)
    .bind(&job.last_failure_code)
    .bind(job.regression_count as i64)
    .bind(job.max_regressions as i64)
    .bind(job.started_at.as_ref().map(format_datetime))
    .bind(job.completed_at.as_ref().map(format_datetime))
    .bind(format_datetime(&job.updated_at))
    .bind(&job.id)
    .bind(write.expected.as_str())
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx)?;

    if result.rows_affected() == 0 {
        return Err(cas_missed(
            conn,
            "SELECT status FROM jobs WHERE id = ?",
            &[job.id.as_str()],
            &format!("job '{}'", job.id),
            write.expected.as_str(),
        )
        .await);
    }
    Ok(())
}

async fn update_task(conn: &mut SqliteConnection, write: &TaskWrite) -> Result<(), RepositoryError> {
    let task = &write.task;
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, attempt = ?, invocation = ?, replay = ?, output = ?,
                error = ?, started_at = ?, completed_at = ?, updated_at = ?
         WHERE job_id = ? AND name = ? AND status = ?",
    )
    .bind(task.status.as_str())
    .bind(task.attempt as i64)
    .bind(task.invocation as i64)
    .bind(task.replay)
    .bind(task.output.as_ref().map(to_json).transpose()?)
    .bind(&task.error)
    .bind(task.started_at.as_ref().map(format_datetime))
    .bind(task.completed_at.as_ref().map(format_datetime))
    .bind(format_datetime(&task.updated_at))
    .bind(&task.job_id)
    .bind(&task.name)
    .bind(write.expected.as_str())
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx)?;

    if result.rows_affected() == 0 {
        return Err(cas_missed(
            conn,
            "SELECT status FROM tasks WHERE job_id = ? AND name = ?",
            &[task.job_id.as_str(), task.name.as_str()],
            &format!("task '{}/{}'", task.job_id, task.name),
            write.expected.as_str(),
        )
        .await);
    }
    Ok(())
}

async fn update_awakeable(
    conn: &mut SqliteConnection,
    write: &AwakeableWrite,
) -> Result<(), RepositoryError> {
    let awakeable = &write.awakeable;
    let result = sqlx::query(
        "UPDATE awakeables SET status = ?, payload = ?, timeout_at = ?, resolved_at = ?
         WHERE id = ? AND status = ?",
    )
    .bind(awakeable.status.as_str())
    .bind(awakeable.payload.as_ref().map(to_json).transpose()?)
    .bind(awakeable.timeout_at.as_ref().map(format_datetime))
    .bind(awakeable.resolved_at.as_ref().map(format_datetime))
    .bind(awakeable.id.as_str())
    .bind(write.expected.as_str())
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx)?;

    if result.rows_affected() == 0 {
        return Err(cas_missed(
            conn,
            "SELECT status FROM awakeables WHERE id = ?",
            &[awakeable.id.as_str()],
            &format!("awakeable '{}'", awakeable.id),
            write.expected.as_str(),
        )
        .await);
    }
    Ok(())
}

async fn check_guard(conn: &mut SqliteConnection, guard: &Guard) -> Result<(), RepositoryError> {
    let (sql, keys, what, expected): (&str, Vec<&str>, String, &str) = match guard {
        Guard::Task {
            job_id,
            name,
            status,
        } => (
            "SELECT status FROM tasks WHERE job_id = ? AND name = ?",
            vec![job_id.as_str(), name.as_str()],
            format!("task '{job_id}/{name}'"),
            status.as_str(),
        ),
        Guard::Awakeable { id, status } => (
            "SELECT status FROM awakeables WHERE id = ?",
            vec![id.as_str()],
            format!("awakeable '{id}'"),
            status.as_str(),
        ),
    };
    match current_status(conn, sql, &keys).await? {
        None => Err(RepositoryError::NotFound),
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(RepositoryError::Conflict(format!(
            "{what} is {actual}, expected {expected}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// DurableStore impl
// ---------------------------------------------------------------------------

impl DurableStore for SqliteStore {
    async fn create_job(&self, job: &Job, tasks: &[Task], event: &Event) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            "INSERT INTO jobs (id, status, position, external_id, scheduled_start_at,
                               completion_result, completion_failure, retry_count, max_retries,
                               retry_delay_ms, retry_scaling, next_retry_at, last_failure,
                               last_failure_code, regression_count, max_regressions,
                               created_at, started_at, completed_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(job.status.as_str())
        .bind(job.position)
        .bind(&job.external_id)
        .bind(job.scheduled_start_at.as_ref().map(format_datetime))
        .bind(job.completion_result.map(|r| r.as_str()))
        .bind(&job.completion_failure)
        .bind(job.retry_count as i64)
        .bind(job.max_retries as i64)
        .bind(job.retry_delay_ms as i64)
        .bind(job.retry_scaling)
        .bind(job.next_retry_at.as_ref().map(format_datetime))
        .bind(&job.last_failure)
        .bind(&job.last_failure_code)
        .bind(job.regression_count as i64)
        .bind(job.max_regressions as i64)
        .bind(format_datetime(&job.created_at))
        .bind(job.started_at.as_ref().map(format_datetime))
        .bind(job.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&job.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_sqlx(e) {
            RepositoryError::Conflict(_) => {
                RepositoryError::Conflict(format!("job '{}' already exists", job.id))
            }
            other => other,
        })?;

        for dep in &job.depends_on {
            sqlx::query("INSERT INTO job_deps (job_id, depends_on) VALUES (?, ?)")
                .bind(&job.id)
                .bind(dep)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        for (seq, task) in tasks.iter().enumerate() {
            insert_task(&mut tx, task, seq).await?;
        }
        insert_event(&mut tx, event).await?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let deps = self.job_deps(Some(id)).await?.remove(id).unwrap_or_default();
                Ok(Some(job_from_row(&row, deps)?))
            }
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE (?1 IS NULL OR status = ?1) ORDER BY position, created_at, id",
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        let mut deps = self.job_deps(None).await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(map_sqlx)?;
                job_from_row(row, deps.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    async fn get_task(&self, job_id: &str, name: &str) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE job_id = ? AND name = ?")
            .bind(job_id)
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let deps = self
                    .task_deps(job_id, Some(name))
                    .await?
                    .remove(name)
                    .unwrap_or_default();
                Ok(Some(task_from_row(&row, deps)?))
            }
            None => Ok(None),
        }
    }

    async fn list_tasks(&self, job_id: &str) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE job_id = ? ORDER BY seq")
            .bind(job_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        let mut deps = self.task_deps(job_id, None).await?;
        rows.iter()
            .map(|row| {
                let name: String = row.try_get("name").map_err(map_sqlx)?;
                task_from_row(row, deps.remove(&name).unwrap_or_default())
            })
            .collect()
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;

        for guard in &batch.guards {
            check_guard(&mut tx, guard).await?;
        }
        for write in &batch.jobs {
            update_job(&mut tx, write).await?;
        }
        for write in &batch.tasks {
            update_task(&mut tx, write).await?;
        }
        for write in &batch.awakeables {
            update_awakeable(&mut tx, write).await?;
        }
        for event in &batch.events {
            insert_event(&mut tx, event).await?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn append_journal(&self, entry: &JournalEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO journal (job_id, task_name, attempt, entry_index, op_type, input_hash,
                                  input, output, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.job_id)
        .bind(&entry.task_name)
        .bind(entry.attempt as i64)
        .bind(entry.entry_index as i64)
        .bind(entry.op_type.as_str())
        .bind(&entry.input_hash)
        .bind(to_json(&entry.input)?)
        .bind(to_json(&entry.output)?)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match map_sqlx(e) {
            RepositoryError::Conflict(_) => RepositoryError::Conflict(format!(
                "journal entry {}/{}/{}#{} already exists",
                entry.job_id, entry.task_name, entry.attempt, entry.entry_index
            )),
            other => other,
        })?;
        Ok(())
    }

    async fn get_journal_entry(
        &self,
        key: &InvocationKey,
        entry_index: u32,
    ) -> Result<Option<JournalEntry>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM journal WHERE job_id = ? AND task_name = ? AND attempt = ? AND entry_index = ?",
        )
        .bind(&key.job_id)
        .bind(&key.task_name)
        .bind(key.attempt as i64)
        .bind(entry_index as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(journal_from_row).transpose()
    }

    async fn count_journal_entries(&self, key: &InvocationKey) -> Result<u32, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM journal WHERE job_id = ? AND task_name = ? AND attempt = ?",
        )
        .bind(&key.job_id)
        .bind(&key.task_name)
        .bind(key.attempt as i64)
        .fetch_one(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        Ok(count.max(0) as u32)
    }

    async fn list_journal(&self, key: &InvocationKey) -> Result<Vec<JournalEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM journal WHERE job_id = ? AND task_name = ? AND attempt = ? ORDER BY entry_index",
        )
        .bind(&key.job_id)
        .bind(&key.task_name)
        .bind(key.attempt as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(journal_from_row).collect()
    }

    async fn save_context(&self, ctx: &ExecutionContext) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO execution_context (job_id, task_name, attempt, entry_index, known_entries,
                                            replay_mode, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(job_id, task_name, attempt) DO UPDATE SET
               entry_index = excluded.entry_index,
               known_entries = excluded.known_entries,
               replay_mode = excluded.replay_mode,
               updated_at = excluded.updated_at",
        )
        .bind(&ctx.job_id)
        .bind(&ctx.task_name)
        .bind(ctx.attempt as i64)
        .bind(ctx.entry_index as i64)
        .bind(ctx.known_entries as i64)
        .bind(ctx.replay_mode)
        .bind(format_datetime(&ctx.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_context(&self, key: &InvocationKey) -> Result<Option<ExecutionContext>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM execution_context WHERE job_id = ? AND task_name = ? AND attempt = ?",
        )
        .bind(&key.job_id)
        .bind(&key.task_name)
        .bind(key.attempt as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(context_from_row).transpose()
    }

    async fn insert_awakeable(&self, awakeable: &Awakeable, event: &Event) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;
        sqlx::query(
            "INSERT INTO awakeables (id, job_id, task_name, attempt, entry_index, status, payload,
                                     timeout_at, created_at, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(awakeable.id.as_str())
        .bind(&awakeable.job_id)
        .bind(&awakeable.task_name)
        .bind(awakeable.attempt as i64)
        .bind(awakeable.entry_index as i64)
        .bind(awakeable.status.as_str())
        .bind(awakeable.payload.as_ref().map(to_json).transpose()?)
        .bind(awakeable.timeout_at.as_ref().map(format_datetime))
        .bind(format_datetime(&awakeable.created_at))
        .bind(awakeable.resolved_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_sqlx(e) {
            RepositoryError::Conflict(_) => {
                RepositoryError::Conflict(format!("awakeable '{}' already exists", awakeable.id))
            }
            other => other,
        })?;
        insert_event(&mut tx, event).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_awakeable(&self, id: &AwakeableId) -> Result<Option<Awakeable>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM awakeables WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(awakeable_from_row).transpose()
    }

    async fn list_awakeables(
        &self,
        job_id: Option<&str>,
        status: Option<AwakeableStatus>,
    ) -> Result<Vec<Awakeable>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM awakeables
             WHERE (?1 IS NULL OR job_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at, id",
        )
        .bind(job_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(awakeable_from_row).collect()
    }

    async fn list_expired_awakeables(&self, now: DateTime<Utc>) -> Result<Vec<Awakeable>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM awakeables
             WHERE status = 'PENDING' AND timeout_at IS NOT NULL AND timeout_at <= ?
             ORDER BY timeout_at, id",
        )
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(awakeable_from_row).collect()
    }

    async fn list_events(&self, job_id: &str) -> Result<Vec<Event>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM events WHERE job_id = ? ORDER BY seq")
            .bind(job_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
