//! Job submission, inspection and cancellation endpoints.
//!
//! Submitted jobs are only persisted here; the engine driver picks them up.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

use nuoc_core::repository::DurableStore;
use nuoc_core::workflow::definition::{parse_job_json, parse_job_yaml};
use nuoc_core::workflow::scheduler::{JobOutcome, SchedulerError};
use nuoc_types::event::Event;
use nuoc_types::job::{Job, JobStatus};
use nuoc_types::task::Task;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobBody {
    pub job: Job,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
pub struct JobsBody {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct EventsBody {
    pub job_id: String,
    pub events: Vec<Event>,
}

#[derive(Debug, Serialize)]
pub struct OutcomeBody {
    pub job_id: String,
    pub result: JobOutcome,
}

fn is_yaml(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("yaml"))
}

async fn load_job(state: &AppState, id: &str) -> Result<JobBody, AppError> {
    let store = state.scheduler.store();
    let job = store
        .get_job(id)
        .await
        .map_err(SchedulerError::from)?
        .ok_or_else(|| AppError::NotFound(format!("Job not found: {id}")))?;
    let tasks = store.list_tasks(id).await.map_err(SchedulerError::from)?;
    Ok(JobBody { job, tasks })
}

/// POST /jobs - Submit a job definition (JSON, or YAML by content type).
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiResponse<JobBody>, AppError> {
    let text = std::str::from_utf8(&body)
        .map_err(|_| AppError::Validation("request body is not UTF-8".to_string()))?;
    let def = if is_yaml(&headers) {
        parse_job_yaml(text)
    } else {
        parse_job_json(text)
    }
    .map_err(SchedulerError::from)?;

    let job = state.scheduler.submit(&def).await?;
    tracing::info!(job_id = %job.id, tasks = def.tasks.len(), "job submitted over HTTP");
    Ok(ApiResponse::created(load_job(&state, &job.id).await?))
}

/// GET /jobs - List jobs in scheduling order, optionally `?status=`.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<ApiResponse<JobsBody>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(AppError::Validation)?;
    let jobs = state
        .scheduler
        .store()
        .list_jobs(status)
        .await
        .map_err(SchedulerError::from)?;
    Ok(ApiResponse::success(JobsBody { jobs }))
}

/// GET /jobs/{id} - A job with its tasks.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse<JobBody>, AppError> {
    Ok(ApiResponse::success(load_job(&state, &id).await?))
}

/// GET /jobs/{id}/events - Audit trail of a job.
pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse<EventsBody>, AppError> {
    let store = state.scheduler.store();
    if store.get_job(&id).await.map_err(SchedulerError::from)?.is_none() {
        return Err(AppError::NotFound(format!("Job not found: {id}")));
    }
    let events = store.list_events(&id).await.map_err(SchedulerError::from)?;
    Ok(ApiResponse::success(EventsBody { job_id: id, events }))
}

/// POST /jobs/{id}/cancel - Cancel a job. Cancelling twice is a no-op.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse<OutcomeBody>, AppError> {
    let result = state.scheduler.cancel(&id).await?;
    tracing::info!(job_id = %id, "job cancelled over HTTP");
    Ok(ApiResponse::success(OutcomeBody { job_id: id, result }))
}
