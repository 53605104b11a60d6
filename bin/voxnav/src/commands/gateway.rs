use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use voxnav_agent::Orchestrator;
use voxnav_audio::CaptureMonitor;
use voxnav_core::types::{CaptureStatus, TaskState};
use voxnav_storage::TaskStore;

#[derive(Clone)]
pub struct GatewayState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<TaskStore>,
    /// Present when `serve` was started with an audio input.
    pub capture: Option<Arc<CaptureMonitor>>,
    pub started: Instant,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct TasksQuery {
    state: Option<String>,
}

#[derive(Deserialize)]
struct CommandRequest {
    text: String,
}

#[derive(Serialize)]
struct CommandResponse {
    task_id: String,
}

#[derive(Serialize)]
struct CancelResponse {
    task_id: String,
    cancelled: bool,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn handle_health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

/// GET /audio/status: capture activity and the live input level
async fn handle_audio_status(State(state): State<GatewayState>) -> impl IntoResponse {
    let status = state.capture.as_ref().map(|m| m.status()).unwrap_or_default();
    Json::<CaptureStatus>(status)
}

/// GET /tasks: live tasks, newest first, optionally filtered by state
async fn handle_tasks(State(state): State<GatewayState>, Query(query): Query<TasksQuery>) -> Response {
    let filter = match query.state.as_deref() {
        None | Some("") => None,
        Some(raw) => match TaskState::from_str(raw) {
            Some(s) => Some(s),
            None => return error(StatusCode::BAD_REQUEST, format!("unknown task state '{}'", raw)),
        },
    };
    Json(state.orchestrator.list(filter)).into_response()
}

async fn handle_summary(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.orchestrator.summary())
}

/// GET /tasks/:id: falls back to the store for tasks evicted from memory
async fn handle_task_get(State(state): State<GatewayState>, AxumPath(id): AxumPath<String>) -> Response {
    if let Some(task) = state.orchestrator.get(&id) {
        return Json(task).into_response();
    }
    match state.store.get_task(&id) {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, format!("task '{}' not found", id)),
        Err(e) => {
            warn!(task_id = %id, error = %e, "Task lookup failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn handle_task_cancel(State(state): State<GatewayState>, AxumPath(id): AxumPath<String>) -> Response {
    if state.orchestrator.get(&id).is_none() {
        return error(StatusCode::NOT_FOUND, format!("task '{}' not found", id));
    }
    let cancelled = state.orchestrator.cancel(&id);
    Json(CancelResponse { task_id: id, cancelled }).into_response()
}

/// POST /commands: submit a typed command
async fn handle_command(State(state): State<GatewayState>, Json(req): Json<CommandRequest>) -> Response {
    let text = req.text.trim();
    if text.is_empty() {
        return error(StatusCode::BAD_REQUEST, "text is required");
    }
    let task_id = state.orchestrator.submit_text(text);
    info!(task_id = %task_id, "Command received over HTTP");
    (StatusCode::ACCEPTED, Json(CommandResponse { task_id })).into_response()
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/audio/status", get(handle_audio_status))
        .route("/tasks", get(handle_tasks))
        .route("/tasks/summary", get(handle_summary))
        .route("/tasks/:id", get(handle_task_get))
        .route("/tasks/:id/cancel", post(handle_task_cancel))
        .route("/commands", post(handle_command))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
