use axum::{
    Extension, Json,
    extract::State,
    response::{IntoResponse, Response},
};

use super::internal_error;
use crate::interfaces::web::AppState;
use crate::interfaces::web::auth::{self, Caller};

pub async fn refresh_all(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
) -> Response {
    if !caller.is_admin() {
        return auth::admin_only();
    }
    match state.pipeline.schedule_bulk_refresh().await {
        Ok(count) => {
            state.scheduler.poke();
            Json(serde_json::json!({ "scheduled": count })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// Read-only view of the task queue, produced inside the scheduler loop
/// so it is consistent with what the loop sees.
pub async fn debug_tasks(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
) -> Response {
    if !caller.is_admin() {
        return auth::admin_only();
    }
    match state.scheduler.snapshot().await {
        Ok(tasks) => Json(serde_json::json!({ "tasks": tasks })).into_response(),
        Err(e) => internal_error(e),
    }
}
