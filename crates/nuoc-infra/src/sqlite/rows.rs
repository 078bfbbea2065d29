//! Row decoding and column encoding helpers.

use chrono::{DateTime, SecondsFormat, Utc};
use nuoc_types::awakeable::Awakeable;
use nuoc_types::error::RepositoryError;
use nuoc_types::event::Event;
use nuoc_types::job::Job;
use nuoc_types::journal::{ExecutionContext, JournalEntry};
use nuoc_types::task::Task;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Classify a sqlx error. Pool exhaustion and lock contention are reported
/// as `Unavailable`, I/O failures as `Connection`, constraint violations as
/// `Conflict`.
pub(crate) fn map_sqlx(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            RepositoryError::Unavailable(e.to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => RepositoryError::Connection(e.to_string()),
        sqlx::Error::Database(db) => {
            let message = db.message();
            if message.contains("UNIQUE") || message.contains("PRIMARY KEY") {
                RepositoryError::Conflict(message.to_string())
            } else if message.contains("database is locked") || message.contains("busy") {
                RepositoryError::Unavailable(message.to_string())
            } else {
                RepositoryError::Query(message.to_string())
            }
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so that text comparison orders instants.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime '{s}': {e}")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn from_json<T: DeserializeOwned>(column: &str, s: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column)
        .map_err(|e| RepositoryError::Query(format!("column {column}: {e}")))
}

fn get_u32(row: &SqliteRow, column: &str) -> Result<u32, RepositoryError> {
    let value: i64 = get(row, column)?;
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("column {column} out of range: {value}")))
}

fn get_datetime(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, RepositoryError> {
    let value: String = get(row, column)?;
    parse_datetime(&value)
}

fn get_opt_datetime(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    let value: Option<String> = get(row, column)?;
    value.as_deref().map(parse_datetime).transpose()
}

fn get_opt_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>, RepositoryError> {
    let value: Option<String> = get(row, column)?;
    value.as_deref().map(|s| from_json(column, s)).transpose()
}

fn get_parsed<T>(row: &SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value: String = get(row, column)?;
    value
        .parse()
        .map_err(|e| RepositoryError::Query(format!("column {column}: {e}")))
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

pub(crate) fn job_from_row(row: &SqliteRow, depends_on: Vec<String>) -> Result<Job, RepositoryError> {
    let completion_result: Option<String> = get(row, "completion_result")?;
    Ok(Job {
        id: get(row, "id")?,
        status: get_parsed(row, "status")?,
        position: get(row, "position")?,
        external_id: get(row, "external_id")?,
        scheduled_start_at: get_opt_datetime(row, "scheduled_start_at")?,
        completion_result: completion_result
            .map(|s| s.parse().map_err(RepositoryError::Query))
            .transpose()?,
        completion_failure: get(row, "completion_failure")?,
        retry_count: get_u32(row, "retry_count")?,
        max_retries: get_u32(row, "max_retries")?,
        retry_delay_ms: get::<i64>(row, "retry_delay_ms")?.max(0) as u64,
        retry_scaling: get(row, "retry_scaling")?,
        next_retry_at: get_opt_datetime(row, "next_retry_at")?,
        last_failure: get(row, "last_failure")?,
        last_failure_code: get(row, "last_failure_code")?,
        regression_count: get_u32(row, "regression_count")?,
        max_regressions: get_u32(row, "max_regressions")?,
        depends_on,
        created_at: get_datetime(row, "created_at")?,
        started_at: get_opt_datetime(row, "started_at")?,
        completed_at: get_opt_datetime(row, "completed_at")?,
        updated_at: get_datetime(row, "updated_at")?,
    })
}

pub(crate) fn task_from_row(row: &SqliteRow, depends_on: Vec<String>) -> Result<Task, RepositoryError> {
    let params: String = get(row, "params")?;
    Ok(Task {
        job_id: get(row, "job_id")?,
        name: get(row, "name")?,
        status: get_parsed(row, "status")?,
        depends_on,
        handler: get(row, "handler")?,
        params: from_json("params", &params)?,
        var: get(row, "var")?,
        gate: get(row, "gate")?,
        condition: get_opt_json(row, "condition")?,
        regress_to: get(row, "regress_to")?,
        priority: get(row, "priority")?,
        attempt: get_u32(row, "attempt")?,
        max_attempts: get_u32(row, "max_attempts")?,
        retry_delay_ms: get::<i64>(row, "retry_delay_ms")?.max(0) as u64,
        retry_scaling: get(row, "retry_scaling")?,
        invocation: get_u32(row, "invocation")?,
        replay: get(row, "replay")?,
        output: get_opt_json(row, "output")?,
        error: get(row, "error")?,
        started_at: get_opt_datetime(row, "started_at")?,
        completed_at: get_opt_datetime(row, "completed_at")?,
        updated_at: get_datetime(row, "updated_at")?,
    })
}

pub(crate) fn journal_from_row(row: &SqliteRow) -> Result<JournalEntry, RepositoryError> {
    let input: String = get(row, "input")?;
    let output: String = get(row, "output")?;
    Ok(JournalEntry {
        job_id: get(row, "job_id")?,
        task_name: get(row, "task_name")?,
        attempt: get_u32(row, "attempt")?,
        entry_index: get_u32(row, "entry_index")?,
        op_type: get_parsed(row, "op_type")?,
        input_hash: get(row, "input_hash")?,
        input: from_json("input", &input)?,
        output: from_json("output", &output)?,
        created_at: get_datetime(row, "created_at")?,
    })
}

pub(crate) fn context_from_row(row: &SqliteRow) -> Result<ExecutionContext, RepositoryError> {
    Ok(ExecutionContext {
        job_id: get(row, "job_id")?,
        task_name: get(row, "task_name")?,
        attempt: get_u32(row, "attempt")?,
        entry_index: get_u32(row, "entry_index")?,
        known_entries: get_u32(row, "known_entries")?,
        replay_mode: get(row, "replay_mode")?,
        updated_at: get_datetime(row, "updated_at")?,
    })
}

pub(crate) fn awakeable_from_row(row: &SqliteRow) -> Result<Awakeable, RepositoryError> {
    Ok(Awakeable {
        id: get_parsed(row, "id")?,
        job_id: get(row, "job_id")?,
        task_name: get(row, "task_name")?,
        attempt: get_u32(row, "attempt")?,
        entry_index: get_u32(row, "entry_index")?,
        status: get_parsed(row, "status")?,
        payload: get_opt_json(row, "payload")?,
        timeout_at: get_opt_datetime(row, "timeout_at")?,
        created_at: get_datetime(row, "created_at")?,
        resolved_at: get_opt_datetime(row, "resolved_at")?,
    })
}

pub(crate) fn event_from_row(row: &SqliteRow) -> Result<Event, RepositoryError> {
    Ok(Event {
        id: get_parsed(row, "id")?,
        job_id: get(row, "job_id")?,
        task_name: get(row, "task_name")?,
        event_type: get_parsed(row, "event_type")?,
        old_state: get(row, "old_state")?,
        new_state: get(row, "new_state")?,
        payload: get(row, "payload")?,
        created_at: get_datetime(row, "created_at")?,
    })
}
