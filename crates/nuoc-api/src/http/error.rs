//! Application error type mapping to HTTP status codes and the error envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nuoc_core::workflow::awakeable::AwakeableError;
use nuoc_core::workflow::scheduler::SchedulerError;
use serde_json::json;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Awakeable(AwakeableError),
    Scheduler(SchedulerError),
    /// Malformed request body.
    Validation(String),
    NotFound(String),
}

impl From<AwakeableError> for AppError {
    fn from(e: AwakeableError) -> Self {
        AppError::Awakeable(e)
    }
}

impl From<SchedulerError> for AppError {
    fn from(e: SchedulerError) -> Self {
        AppError::Scheduler(e)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Awakeable(AwakeableError::NotFound(_) | AwakeableError::InvalidId(_)) => {
                StatusCode::NOT_FOUND
            }
            AppError::Awakeable(AwakeableError::AlreadyResolved { .. }) => StatusCode::CONFLICT,
            AppError::Awakeable(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Awakeable(_) => StatusCode::INTERNAL_SERVER_ERROR,

            AppError::Scheduler(SchedulerError::NotFound(_) | SchedulerError::UnknownTask { .. }) => {
                StatusCode::NOT_FOUND
            }
            AppError::Scheduler(SchedulerError::Definition(_)) => StatusCode::BAD_REQUEST,
            AppError::Scheduler(
                SchedulerError::AlreadyExists(_)
                | SchedulerError::NotRunnable { .. }
                | SchedulerError::NotDue { .. }
                | SchedulerError::DependenciesUnmet { .. }
                | SchedulerError::RegressionLimit { .. },
            ) => StatusCode::CONFLICT,
            AppError::Scheduler(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,

            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Awakeable(AwakeableError::NotFound(id)) => format!("Awakeable not found: {id}"),
            AppError::Awakeable(AwakeableError::InvalidId(e)) => format!("Awakeable not found: {e}"),
            AppError::Awakeable(AwakeableError::AlreadyResolved { id, status }) => {
                format!("Awakeable not pending (status: {status}): {id}")
            }
            AppError::Awakeable(e) => e.to_string(),
            AppError::Scheduler(e) => e.to_string(),
            AppError::Validation(msg) | AppError::NotFound(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %message, "request rejected");
        }

        let body = json!({
            "success": false,
            "error": message,
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
