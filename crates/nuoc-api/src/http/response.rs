//! Success envelope for API responses.
//!
//! ```json
//! { "success": true, "awakeable_id": "awk_1...", "message": "..." }
//! ```
//!
//! The payload's fields sit next to `success` at the top level. Errors use
//! the same shape with `success: false`, see [`super::error::AppError`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// A successful response. `body` must serialize to a JSON object.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub body: T,
    #[serde(skip)]
    status: StatusCode,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(body: T) -> Self {
        Self {
            success: true,
            body,
            status: StatusCode::OK,
        }
    }

    /// 201 Created.
    pub fn created(body: T) -> Self {
        Self {
            status: StatusCode::CREATED,
            ..Self::success(body)
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let (status, body) = match serde_json::to_string(&self) {
            Ok(body) => (self.status, body),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    r#"{"success":false,"error":"failed to serialize response"}"#.to_string(),
                )
            }
        };

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}
