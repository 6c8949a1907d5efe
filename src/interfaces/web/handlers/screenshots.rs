use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};

use super::{internal_error, not_found};
use crate::interfaces::web::AppState;

/// Serve a stored screenshot. IDs are UUIDs handed out through results
/// and geometry entries, never enumerable.
pub async fn get_screenshot(
    Path(screenshot_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.store.screenshot(&screenshot_id).await {
        Ok(Some(data)) => ([(header::CONTENT_TYPE, "image/png")], data).into_response(),
        Ok(None) => not_found("no such screenshot"),
        Err(e) => internal_error(e),
    }
}

/// Thumbnail alias. The captures are viewport-sized already; clients
/// scale them down, so this serves the same PNG.
pub async fn get_thumbnail(
    path: Path<String>,
    state: State<AppState>,
) -> Response {
    get_screenshot(path, state).await
}
