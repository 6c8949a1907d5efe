use axum::{
    Extension, Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use chrono::{Local, Utc};

use super::{bad_request, conflict, internal_error, not_found};
use crate::core::types::TaskKind;
use crate::interfaces::web::AppState;
use crate::interfaces::web::auth::{self, Caller};

pub async fn list_courses(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
) -> Response {
    let Some(user) = caller.user() else {
        return auth::user_only();
    };
    match state.store.courses_for_user(user).await {
        Ok(courses) => Json(courses).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Schedule a timetable scan for the calling user. Dedup means repeated
/// clicks while one is pending are no-ops.
pub async fn refresh_courses(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
) -> Response {
    let Some(user) = caller.user() else {
        return auth::user_only();
    };
    if !user.has_credentials() {
        return bad_request("store your school credentials first");
    }
    let created = state
        .store
        .create_task(
            TaskKind::CourseRefresh,
            Some(&user.id),
            None,
            Local::now().date_naive(),
            Utc::now(),
        )
        .await;
    match created {
        Ok((_, fresh)) => {
            state.scheduler.poke();
            Json(serde_json::json!({ "scheduled": fresh })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(serde::Deserialize)]
pub struct ConfigureCourseRequest {
    pub has_attendance_form: bool,
    #[serde(default)]
    pub form_url: Option<String>,
    #[serde(default)]
    pub form_config_id: Option<String>,
    /// Admin only: freeze the linkage so users can no longer change it.
    #[serde(default)]
    pub lock: Option<bool>,
}

pub async fn configure_course(
    Extension(caller): Extension<Caller>,
    Path(course_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ConfigureCourseRequest>,
) -> Response {
    let course = match state.store.course_by_id(&course_id).await {
        Ok(Some(course)) => course,
        Ok(None) => return not_found("no such course"),
        Err(e) => return internal_error(e),
    };
    if let Some(user) = caller.user() {
        if !user.course_ids.contains(&course.id) {
            return bad_request("this course is not on your timetable");
        }
        if course.configuration_locked {
            return conflict("this course's form configuration is locked");
        }
        if payload.lock.is_some() {
            return auth::admin_only();
        }
    }

    if let Some(url) = &payload.form_url {
        let parsed = url::Url::parse(url);
        if !matches!(&parsed, Ok(u) if u.scheme() == "http" || u.scheme() == "https") {
            return bad_request("form_url is not a valid http(s) URL");
        }
    }
    if let Some(style_id) = &payload.form_config_id {
        match state.store.form_style(style_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return bad_request("form_config_id does not name a known form style"),
            Err(e) => return internal_error(e),
        }
    }
    if payload.has_attendance_form
        && (payload.form_url.is_none() || payload.form_config_id.is_none())
    {
        return bad_request("a linked form needs both form_url and form_config_id");
    }

    if let Err(e) = state
        .store
        .set_course_form(
            &course.id,
            payload.has_attendance_form,
            payload.form_url.as_deref(),
            payload.form_config_id.as_deref(),
        )
        .await
    {
        return internal_error(e);
    }
    if caller.is_admin() {
        if let Some(lock) = payload.lock {
            if let Err(e) = state.store.set_course_locked(&course.id, lock).await {
                return internal_error(e);
            }
        }
    }

    match state.store.course_by_id(&course.id).await {
        Ok(Some(course)) => Json(course).into_response(),
        Ok(None) => not_found("no such course"),
        Err(e) => internal_error(e),
    }
}
