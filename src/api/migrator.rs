use axum::{
    extract::{Json, State},
    http::StatusCode,
};
use log::info;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::scheduler::SchedulerStatus;

use super::{error_response, ApiResult, AppState, OkResponse};

/// Request structure for switching pattern by name
#[derive(Debug, Serialize, Deserialize)]
pub struct PatternRequest {
    pub pattern: String,
}

/// Request structure for starting an incremental validation
#[derive(Debug, Serialize, Deserialize)]
pub struct IncrRequest {
    /// Watermark, epoch ms
    pub update_at: i64,
    /// Poll interval once caught up, ms
    pub interval: i64,
}

fn ok() -> ApiResult<OkResponse> {
    Ok((StatusCode::OK, Json(OkResponse::ok())))
}

/// POST /src_only
pub async fn src_only<T: Entity>(State(state): State<AppState<T>>) -> ApiResult<OkResponse> {
    state.scheduler.src_only();
    ok()
}

/// POST /src_first
pub async fn src_first<T: Entity>(State(state): State<AppState<T>>) -> ApiResult<OkResponse> {
    state.scheduler.src_first();
    ok()
}

/// POST /dst_first
pub async fn dst_first<T: Entity>(State(state): State<AppState<T>>) -> ApiResult<OkResponse> {
    state.scheduler.dst_first();
    ok()
}

/// POST /dst_only
pub async fn dst_only<T: Entity>(State(state): State<AppState<T>>) -> ApiResult<OkResponse> {
    state.scheduler.dst_only();
    ok()
}

/// POST /pattern
///
/// Switches to the pattern named in the body. Unknown names are a 400.
pub async fn set_pattern<T: Entity>(
    State(state): State<AppState<T>>,
    Json(req): Json<PatternRequest>,
) -> ApiResult<OkResponse> {
    state
        .scheduler
        .set_pattern(&req.pattern)
        .map_err(|e| error_response("Failed to switch pattern", e))?;
    ok()
}

/// POST /full/start
pub async fn start_full<T: Entity>(State(state): State<AppState<T>>) -> ApiResult<OkResponse> {
    let run = state
        .scheduler
        .start_full_validation()
        .map_err(|e| error_response("Failed to start full validation", e))?;
    info!("Full validation run {} requested", run.run_id);
    ok()
}

/// POST /full/stop
pub async fn stop_full<T: Entity>(State(state): State<AppState<T>>) -> ApiResult<OkResponse> {
    state.scheduler.stop_full_validation();
    ok()
}

/// POST /incr/start
pub async fn start_incr<T: Entity>(
    State(state): State<AppState<T>>,
    Json(req): Json<IncrRequest>,
) -> ApiResult<OkResponse> {
    let run = state
        .scheduler
        .start_incr_validation(req.update_at, req.interval)
        .map_err(|e| error_response("Failed to start incremental validation", e))?;
    info!("Incremental validation run {} requested", run.run_id);
    ok()
}

/// POST /incr/stop
pub async fn stop_incr<T: Entity>(State(state): State<AppState<T>>) -> ApiResult<OkResponse> {
    state.scheduler.stop_incr_validation();
    ok()
}

/// GET /status
pub async fn status<T: Entity>(State(state): State<AppState<T>>) -> ApiResult<SchedulerStatus> {
    let status = state
        .scheduler
        .status()
        .map_err(|e| error_response("Failed to read scheduler status", e))?;
    Ok((StatusCode::OK, Json(status)))
}
