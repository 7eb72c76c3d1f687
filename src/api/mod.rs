pub mod migrator;
pub mod state;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use log::error;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::CutoverError;
use crate::scheduler::Scheduler;

pub use state::AppState;

/// Body of every successful control call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkResponse {
    pub msg: String,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { msg: "OK".to_owned() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub msg: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<R> = Result<(StatusCode, Json<R>), ApiError>;

/// Configuration errors are 400s; everything else is a 500
pub fn error_response(context: &str, e: CutoverError) -> ApiError {
    error!("{}: {}", context, e);
    let status = if e.is_config_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorResponse {
            code: status.as_u16(),
            msg: e.to_string(),
        }),
    )
}

/// Control routes for one migrated table, nested under `prefix`
pub fn create_router<T: Entity>(scheduler: Arc<Scheduler<T>>, prefix: &str) -> Router {
    let routes = Router::new()
        .route("/src_only", post(migrator::src_only::<T>))
        .route("/src_first", post(migrator::src_first::<T>))
        .route("/dst_first", post(migrator::dst_first::<T>))
        .route("/dst_only", post(migrator::dst_only::<T>))
        .route("/pattern", post(migrator::set_pattern::<T>))
        .route("/full/start", post(migrator::start_full::<T>))
        .route("/full/stop", post(migrator::stop_full::<T>))
        .route("/incr/start", post(migrator::start_incr::<T>))
        .route("/incr/stop", post(migrator::stop_incr::<T>))
        .route("/status", get(migrator::status::<T>))
        .with_state(AppState::new(scheduler));

    Router::new().nest(prefix, routes)
}
