//! Axum router configuration with middleware.
//!
//! Middleware: CORS, request tracing.

use axum::Router;
use axum::routing::{get, post};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use nuoc_core::repository::DurableStore;

use crate::http::error::AppError;
use crate::http::handlers;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        // Awakeables
        .route(
            "/awakeables/{id}/resolve",
            post(handlers::awakeable::resolve_awakeable),
        )
        .route(
            "/awakeables/{id}/reject",
            post(handlers::awakeable::reject_awakeable),
        )
        // Jobs
        .route(
            "/jobs",
            post(handlers::job::submit_job).get(handlers::job::list_jobs),
        )
        .route("/jobs/{id}", get(handlers::job::get_job))
        .route("/jobs/{id}/events", get(handlers::job::list_events))
        .route("/jobs/{id}/cancel", post(handlers::job::cancel_job))
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    message: &'static str,
    version: &'static str,
}

/// GET /health - Liveness plus a store round trip.
async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<ApiResponse<HealthBody>, AppError> {
    state
        .store
        .health_check()
        .await
        .map_err(nuoc_core::workflow::scheduler::SchedulerError::from)?;
    Ok(ApiResponse::success(HealthBody {
        status: "ok",
        message: "nuoc server is running",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found() -> AppError {
    AppError::NotFound("Not found".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use nuoc_core::workflow::handler::{HandlerRegistry, TaskContext};
    use nuoc_core::workflow::scheduler::JobOutcome;
    use nuoc_infra::sqlite::SqliteStore;
    use nuoc_infra::sqlite::pool::database_url_for;
    use nuoc_types::awakeable::AwakeableStatus;
    use nuoc_types::config::EngineConfig;
    use nuoc_types::task::TaskStatus;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    async fn test_state(dir: &tempfile::TempDir) -> (AppState, Arc<AtomicU32>) {
        let store = SqliteStore::open(&database_url_for(dir.path())).await.unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("approve", move |ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let id = ctx.awakeable().await?;
                let decision = ctx.await_awakeable(&id).await?;
                Ok(json!({ "decision": decision }))
            }
        });
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        (AppState::from_parts(store, config, handlers), runs)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn approval_def(id: &str) -> Value {
        json!({
            "id": id,
            "tasks": [{
                "name": "approve",
                "retry": { "max_attempts": 1, "delay_ms": 1 }
            }]
        })
    }

    /// Submit a job with one `approve` task and run it until it suspends.
    async fn suspended_job(state: &AppState, app: &Router, id: &str) -> String {
        let def = approval_def(id);
        let (status, body) = send(app, "POST", "/jobs", &def.to_string()).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["success"], true);

        let outcome = state.scheduler.run(id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Suspended);
        let pending = state
            .store
            .list_awakeables(Some(id), Some(AwakeableStatus::Pending))
            .await
            .unwrap();
        pending[0].id.to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(&dir).await;
        let app = build_router(state);

        let (status, body) = send(&app, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, "GET", "/nowhere", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_resolve_wakes_task_and_is_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let (state, runs) = test_state(&dir).await;
        let app = build_router(state.clone());
        let id = suspended_job(&state, &app, "review").await;

        let uri = format!("/awakeables/{id}/resolve");
        let (status, body) = send(&app, "POST", &uri, r#"{"approved":true}"#).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["awakeable_id"], id.as_str());
        assert_eq!(body["payload"], json!({ "approved": true }));

        let task = state.store.get_task("review", "approve").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let (status, body) = send(&app, "POST", &uri, r#"{"approved":false}"#).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("not pending"));

        assert_eq!(state.scheduler.run("review").await.unwrap(), JobOutcome::Completed);
        let task = state.store.get_task("review", "approve").await.unwrap().unwrap();
        assert_eq!(task.output, Some(json!({ "decision": { "approved": true } })));
        // Handler body re-ran on wake-up; the awakeable itself was replayed.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(&dir).await;
        let app = build_router(state.clone());

        let (status, _) = send(&app, "POST", "/awakeables/awk_1nope/resolve", "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "POST", "/awakeables/garbage/resolve", "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let id = suspended_job(&state, &app, "bad-json").await;
        let uri = format!("/awakeables/{id}/resolve");
        let (status, body) = send(&app, "POST", &uri, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Invalid JSON"));

        // Empty body resolves with `{}`.
        let (status, body) = send(&app, "POST", &uri, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payload"], json!({}));
    }

    #[tokio::test]
    async fn test_reject_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(&dir).await;
        let app = build_router(state.clone());
        let id = suspended_job(&state, &app, "deny").await;

        let uri = format!("/awakeables/{id}/reject");
        let (status, body) = send(&app, "POST", &uri, r#"{"reason":"not today"}"#).await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let outcome = state.scheduler.run("deny").await.unwrap();
        let JobOutcome::Failed { reason } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("not today"), "{reason}");
    }

    #[tokio::test]
    async fn test_job_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(&dir).await;
        let app = build_router(state.clone());

        let (status, body) = send(&app, "POST", "/jobs", "{").await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        let cyclic = json!({ "id": "loop", "tasks": [
            { "name": "a", "handler": "approve", "depends_on": ["b"] },
            { "name": "b", "handler": "approve", "depends_on": ["a"] }
        ]});
        let (status, body) = send(&app, "POST", "/jobs", &cyclic.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("circular"));

        suspended_job(&state, &app, "inspect").await;
        let def = approval_def("inspect");
        let (status, _) = send(&app, "POST", "/jobs", &def.to_string()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, "GET", "/jobs/inspect", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["status"], "suspended");
        assert_eq!(body["tasks"][0]["name"], "approve");

        let (status, body) = send(&app, "GET", "/jobs?status=suspended", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "GET", "/jobs/inspect/events", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["events"][0]["event_type"], "job.Submitted");

        let (status, body) = send(&app, "POST", "/jobs/inspect/cancel", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["outcome"], "cancelled");
        let awakeables = state.store.list_awakeables(Some("inspect"), None).await.unwrap();
        assert_eq!(awakeables[0].status, AwakeableStatus::Cancelled);

        let (status, _) = send(&app, "GET", "/jobs/missing", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "POST", "/jobs/missing/cancel", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
