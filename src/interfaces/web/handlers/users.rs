use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Local;
use tracing::info;

use super::{bad_request, internal_error, not_found};
use crate::core::school::SchoolError;
use crate::core::types::User;
use crate::interfaces::web::AppState;
use crate::interfaces::web::auth::{self, Caller};

fn profile_json(user: &User) -> serde_json::Value {
    serde_json::json!({
        "id": user.id,
        "login": user.login,
        "active": user.active,
        "grade": user.grade,
        "first_name": user.first_name,
        "last_name": user.last_name,
        "has_credentials": user.has_credentials(),
    })
}

pub async fn create_user(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
) -> Response {
    if !caller.is_admin() {
        return auth::admin_only();
    }
    match state.store.create_user().await {
        Ok(token) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "token": token })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_user(Extension(caller): Extension<Caller>) -> Response {
    match caller.user() {
        Some(user) => Json(profile_json(user)).into_response(),
        None => auth::user_only(),
    }
}

#[derive(serde::Deserialize)]
pub struct UpdateUserRequest {
    pub login: Option<String>,
    pub password: Option<String>,
    pub active: Option<bool>,
    pub grade: Option<i64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

pub async fn update_user(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    Json(payload): Json<UpdateUserRequest>,
) -> Response {
    let Some(user) = caller.user() else {
        return auth::user_only();
    };

    // Credentials come as a pair and are validated against the school
    // service before anything is stored. Only the ciphertext ever
    // reaches the database.
    match (&payload.login, &payload.password) {
        (Some(login), Some(password)) => {
            let login = login.trim();
            if login.is_empty() || password.is_empty() {
                return bad_request("login and password must not be empty");
            }
            match state.pipeline.school().login(login, password).await {
                Ok(_) => {}
                Err(SchoolError::LoginFailed) => {
                    return bad_request("the school service rejected these credentials");
                }
                Err(e) => {
                    return internal_error(anyhow::anyhow!(
                        "could not verify credentials: {}",
                        e
                    ));
                }
            }
            let ciphertext = match state.pipeline.vault().encrypt(password) {
                Ok(ciphertext) => ciphertext,
                Err(e) => return internal_error(e),
            };
            if let Err(e) = state.store.set_credentials(&user.id, login, &ciphertext).await {
                return internal_error(e);
            }
            if let Err(e) = state.pipeline.schedule_user_onboarding(&user.id).await {
                return internal_error(e);
            }
            state.scheduler.poke();
            info!(user = %user.id, "credentials updated");
        }
        (None, None) => {}
        _ => return bad_request("login and password must be set together"),
    }

    if payload.grade.is_some() || payload.first_name.is_some() || payload.last_name.is_some() {
        if let Err(e) = state
            .store
            .set_user_profile(
                &user.id,
                payload.grade,
                payload.first_name.as_deref(),
                payload.last_name.as_deref(),
            )
            .await
        {
            return internal_error(e);
        }
    }
    if let Some(active) = payload.active {
        if let Err(e) = state.store.set_user_active(&user.id, active).await {
            return internal_error(e);
        }
    }

    match state.store.user_by_id(&user.id).await {
        Ok(Some(user)) => Json(profile_json(&user)).into_response(),
        Ok(None) => not_found("user no longer exists"),
        Err(e) => internal_error(e),
    }
}

pub async fn delete_user(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
) -> Response {
    let Some(user) = caller.user() else {
        return auth::user_only();
    };
    match state.store.delete_user(&user.id).await {
        Ok(()) => Json(serde_json::json!({ "deleted": true })).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn user_status(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
) -> Response {
    let Some(user) = caller.user() else {
        return auth::user_only();
    };

    let result = match state.store.fill_result(&user.id, false).await {
        Ok(result) => result,
        Err(e) => return internal_error(e),
    };
    let test_result = match state.store.fill_result(&user.id, true).await {
        Ok(result) => result,
        Err(e) => return internal_error(e),
    };
    let errors = match state.store.errors_for(&user.id).await {
        Ok(errors) => errors,
        Err(e) => return internal_error(e),
    };

    let mut related_course = serde_json::Value::Null;
    if let Some(course_id) = result.as_ref().and_then(|r| r.course_id.as_deref()) {
        if let Ok(Some(course)) = state.store.course_by_id(course_id).await {
            related_course = serde_json::Value::String(course.course_code);
        }
    }

    let result_json = |r: &crate::core::types::FillResult| {
        serde_json::json!({
            "status": r.status.as_str(),
            "last_filled_at": r.time_logged.to_rfc3339(),
            "form_screenshot_id": r.form_screenshot_id,
            "confirm_screenshot_id": r.confirm_screenshot_id,
        })
    };

    Json(serde_json::json!({
        "status": result.as_ref().map(|r| r.status.as_str()),
        "last_filled_at": result.as_ref().map(|r| r.time_logged.to_rfc3339()),
        "related_course": related_course,
        "result": result.as_ref().map(result_json),
        "test_result": test_result.as_ref().map(result_json),
        "today": Local::now().date_naive().to_string(),
        "errors": errors
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id,
                    "kind": e.kind.as_str(),
                    "message": e.message,
                    "time_logged": e.time_logged.to_rfc3339(),
                })
            })
            .collect::<Vec<_>>(),
    }))
    .into_response()
}

pub async fn delete_error(
    Extension(caller): Extension<Caller>,
    Path(error_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let Some(user) = caller.user() else {
        return auth::user_only();
    };
    match state.store.delete_error(&user.id, &error_id).await {
        Ok(true) => Json(serde_json::json!({ "deleted": true })).into_response(),
        Ok(false) => not_found("no such error"),
        Err(e) => internal_error(e),
    }
}
