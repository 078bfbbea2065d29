//! Awakeable resolution endpoints.
//!
//! Resolving wakes the suspended task; the engine driver runs it on its next
//! tick. Only a pending awakeable can be completed, and only once.

use axum::body::Bytes;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use nuoc_types::awakeable::AwakeableId;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Reason recorded when a reject request carries none.
const DEFAULT_REJECT_REASON: &str = "rejected";

#[derive(Debug, Serialize)]
pub struct ResolvedBody {
    pub awakeable_id: String,
    pub job_id: String,
    pub task_name: String,
    pub payload: Value,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

fn parse_id(raw: &str) -> Result<AwakeableId, AppError> {
    raw.parse::<AwakeableId>()
        .map_err(|_| AppError::NotFound(format!("Awakeable not found: {raw}")))
}

fn is_blank(body: &Bytes) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::Validation(format!("Invalid JSON payload: {e}")))
}

/// POST /awakeables/{id}/resolve - Resolve with the request body as payload.
pub async fn resolve_awakeable(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<ApiResponse<ResolvedBody>, AppError> {
    let id = parse_id(&id)?;
    // An empty body resolves with `{}`.
    let payload: Value = if is_blank(&body) {
        Value::Object(Default::default())
    } else {
        parse_json(&body)?
    };

    let awakeable = state.scheduler.awakeables().resolve(&id, payload).await?;
    tracing::info!(awakeable = %id, job_id = %awakeable.job_id, task = %awakeable.task_name, "awakeable resolved over HTTP");

    Ok(ApiResponse::success(ResolvedBody {
        awakeable_id: id.to_string(),
        job_id: awakeable.job_id,
        task_name: awakeable.task_name,
        payload: awakeable.payload.unwrap_or(Value::Null),
        message: "Awakeable resolved successfully".to_string(),
    }))
}

/// POST /awakeables/{id}/reject - Reject with an optional `{reason}`.
pub async fn reject_awakeable(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<ApiResponse<ResolvedBody>, AppError> {
    let id = parse_id(&id)?;
    let request: RejectRequest = if is_blank(&body) {
        RejectRequest::default()
    } else {
        parse_json(&body)?
    };
    let reason = request
        .reason
        .unwrap_or_else(|| DEFAULT_REJECT_REASON.to_string());

    let awakeable = state.scheduler.awakeables().reject(&id, &reason).await?;
    tracing::info!(awakeable = %id, job_id = %awakeable.job_id, reason = %reason, "awakeable rejected over HTTP");

    Ok(ApiResponse::success(ResolvedBody {
        awakeable_id: id.to_string(),
        job_id: awakeable.job_id,
        task_name: awakeable.task_name,
        payload: awakeable.payload.unwrap_or(Value::Null),
        message: "Awakeable rejected".to_string(),
    }))
}
