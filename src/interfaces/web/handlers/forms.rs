use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::{bad_request, internal_error, not_found};
use crate::core::geometry::{default_fields_from_geometry, score_styles};
use crate::interfaces::web::AppState;
use crate::interfaces::web::auth::{self, Caller};

#[derive(serde::Deserialize)]
pub struct FormGeometryRequest {
    pub url: String,
}

/// Request (or poll) the probed geometry of a form URL. The first call
/// kicks off a detached browser probe; later calls return the cached
/// outcome plus ranked style candidates.
pub async fn form_geometry(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    Json(payload): Json<FormGeometryRequest>,
) -> Response {
    let Some(user) = caller.user() else {
        return auth::user_only();
    };
    let parsed = url::Url::parse(&payload.url);
    if !matches!(&parsed, Ok(u) if u.scheme() == "http" || u.scheme() == "https") {
        return bad_request("url is not a valid http(s) URL");
    }
    if !user.has_credentials() {
        return bad_request("store your school credentials before probing a form");
    }

    let began = match state
        .store
        .geometry_begin(&payload.url, Some(&user.id))
        .await
    {
        Ok(began) => began,
        Err(e) => return internal_error(e),
    };
    if began {
        let pipeline = state.pipeline.clone();
        let url = payload.url.clone();
        let user = user.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.probe_form(&url, &user).await {
                warn!(url = %url, "form probe could not record its outcome: {:#}", e);
            }
        });
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "pending": true })),
        )
            .into_response();
    }

    let entry = match state.store.geometry_entry(&payload.url).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return not_found("no probe recorded for this URL"),
        Err(e) => return internal_error(e),
    };
    if entry.is_pending() {
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "pending": true })),
        )
            .into_response();
    }
    if let Some(error) = &entry.error {
        return Json(serde_json::json!({
            "pending": false,
            "error": error,
            "screenshot_id": entry.screenshot_id,
        }))
        .into_response();
    }

    let Some(geometry) = entry.geometry.clone() else {
        return internal_error(anyhow::anyhow!("geometry entry is neither pending nor resolved"));
    };
    let styles = match state.store.all_form_styles().await {
        Ok(styles) => styles,
        Err(e) => return internal_error(e),
    };
    Json(serde_json::json!({
        "pending": false,
        "url": entry.url,
        "auth_required": geometry.auth_required,
        "geometry": geometry,
        "screenshot_id": entry.screenshot_id,
        "candidates": score_styles(&geometry, &styles),
        "suggested_fields": default_fields_from_geometry(&geometry),
    }))
    .into_response()
}

#[derive(serde::Deserialize)]
pub struct TestFillRequest {
    pub course_id: String,
}

/// Schedule a dry-run fill of one course's form. The result lands in
/// `/user/status` as a test result and is pruned automatically.
pub async fn test_fill(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    Json(payload): Json<TestFillRequest>,
) -> Response {
    let Some(user) = caller.user() else {
        return auth::user_only();
    };
    if !user.has_credentials() {
        return bad_request("store your school credentials first");
    }
    if !user.course_ids.contains(&payload.course_id) {
        return bad_request("this course is not on your timetable");
    }
    let course = match state.store.course_by_id(&payload.course_id).await {
        Ok(Some(course)) => course,
        Ok(None) => return not_found("no such course"),
        Err(e) => return internal_error(e),
    };
    if !course.has_attendance_form || course.form_url.is_none() || course.form_config_id.is_none() {
        return bad_request("this course has no linked attendance form");
    }
    match state.pipeline.schedule_test_run(&user.id, &course.id).await {
        Ok(()) => {
            state.scheduler.poke();
            Json(serde_json::json!({ "scheduled": true })).into_response()
        }
        Err(e) => internal_error(e),
    }
}
