use axum::{
    Router,
    http::Method,
    middleware,
    routing::{delete, get, patch, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{admin, courses, forms, screenshots, users};

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/user",
            post(users::create_user)
                .get(users::get_user)
                .patch(users::update_user)
                .delete(users::delete_user),
        )
        .route("/user/status", get(users::user_status))
        .route("/user/error/{id}", delete(users::delete_error))
        .route("/user/courses", get(courses::list_courses))
        .route("/user/courses/update", post(courses::refresh_courses))
        .route("/course/{id}", patch(courses::configure_course))
        .route("/form_geometry", post(forms::form_geometry))
        .route("/test_fill", post(forms::test_fill))
        .route("/admin/refresh_all", post(admin::refresh_all))
        .route("/debug/tasks", get(admin::debug_tasks))
        .route("/screenshot/{id}", get(screenshots::get_screenshot))
        .route(
            "/screenshot/{id}/thumb.png",
            get(screenshots::get_thumbnail),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(build_cors())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FieldKind, FormStyle, SubField};
    use crate::interfaces::web::auth::tests::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", token));
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).expect("request should build"))
            .await
            .expect("oneshot should succeed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body should collect");
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn user_creation_requires_the_admin_token() {
        let state = test_state(Some("admin-secret")).await;
        let user_token = state.store.create_user().await.expect("user");
        let app = build_api_router(state);

        let (status, _) = call(&app, "POST", "/user", &user_token, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&app, "POST", "/user", "admin-secret", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["token"].as_str().is_some());
    }

    #[tokio::test]
    async fn profile_round_trips_without_exposing_secrets() {
        let state = test_state(None).await;
        let token = state.store.create_user().await.expect("user");
        let app = build_api_router(state);

        let (status, body) = call(
            &app,
            "PATCH",
            "/user",
            &token,
            Some(serde_json::json!({ "first_name": "Ada", "grade": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["first_name"], "Ada");
        assert_eq!(body["grade"], 10);
        assert_eq!(body["has_credentials"], false);
        assert!(body.get("password").is_none());
        assert!(body.get("password_ciphertext").is_none());

        let (status, body) = call(&app, "GET", "/user", &token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["first_name"], "Ada");
    }

    #[tokio::test]
    async fn credentials_must_come_as_a_pair() {
        let state = test_state(None).await;
        let token = state.store.create_user().await.expect("user");
        let app = build_api_router(state);

        let (status, body) = call(
            &app,
            "PATCH",
            "/user",
            &token,
            Some(serde_json::json!({ "login": "123456" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn status_starts_empty() {
        let state = test_state(None).await;
        let token = state.store.create_user().await.expect("user");
        let app = build_api_router(state);

        let (status, body) = call(&app, "GET", "/user/status", &token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["status"].is_null());
        assert_eq!(body["errors"].as_array().expect("array").len(), 0);
    }

    #[tokio::test]
    async fn deleting_an_unknown_error_is_a_404() {
        let state = test_state(None).await;
        let token = state.store.create_user().await.expect("user");
        let app = build_api_router(state);

        let (status, _) = call(&app, "DELETE", "/user/error/nope", &token, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn course_refresh_needs_stored_credentials() {
        let state = test_state(None).await;
        let token = state.store.create_user().await.expect("user");
        let app = build_api_router(state);

        let (status, _) = call(&app, "POST", "/user/courses/update", &token, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn locked_course_rejects_user_reconfiguration() {
        let state = test_state(Some("admin-secret")).await;
        let token = state.store.create_user().await.expect("user");
        let user = state
            .store
            .user_by_token(&token)
            .await
            .expect("lookup")
            .expect("user");
        let course = state
            .store
            .upsert_course("MCR3U1-2", "A. Teacher", Some("2-1a"))
            .await
            .expect("course");
        state
            .store
            .set_user_courses(&user.id, &[course.id.clone()])
            .await
            .expect("courses set");
        state
            .store
            .set_course_locked(&course.id, true)
            .await
            .expect("locked");
        let app = build_api_router(state);

        let (status, _) = call(
            &app,
            "PATCH",
            &format!("/course/{}", course.id),
            &token,
            Some(serde_json::json!({ "has_attendance_form": false })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        // The admin token is not bound by the lock.
        let (status, body) = call(
            &app,
            "PATCH",
            &format!("/course/{}", course.id),
            "admin-secret",
            Some(serde_json::json!({ "has_attendance_form": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_attendance_form"], false);
    }

    #[tokio::test]
    async fn course_linkage_validates_url_and_style() {
        let state = test_state(Some("admin-secret")).await;
        let course = state
            .store
            .upsert_course("ENG2D1-1", "B. Teacher", None)
            .await
            .expect("course");
        state
            .store
            .insert_form_style(&FormStyle {
                id: "style-1".into(),
                name: "standard".into(),
                is_default: true,
                thumbnail_id: None,
                sub_fields: vec![SubField {
                    index_on_page: 0,
                    expected_label_segment: "Name".into(),
                    kind: FieldKind::Text,
                    critical: true,
                    target_value: "$name".into(),
                }],
            })
            .await
            .expect("style");
        let app = build_api_router(state);

        let (status, _) = call(
            &app,
            "PATCH",
            &format!("/course/{}", course.id),
            "admin-secret",
            Some(serde_json::json!({
                "has_attendance_form": true,
                "form_url": "not a url",
                "form_config_id": "style-1",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "PATCH",
            &format!("/course/{}", course.id),
            "admin-secret",
            Some(serde_json::json!({
                "has_attendance_form": true,
                "form_url": "https://docs.google.com/forms/d/e/abc/viewform",
                "form_config_id": "missing-style",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            "PATCH",
            &format!("/course/{}", course.id),
            "admin-secret",
            Some(serde_json::json!({
                "has_attendance_form": true,
                "form_url": "https://docs.google.com/forms/d/e/abc/viewform",
                "form_config_id": "style-1",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["form_config_id"], "style-1");
    }

    #[tokio::test]
    async fn debug_tasks_is_admin_only_and_reflects_the_queue() {
        let state = test_state(Some("admin-secret")).await;
        let token = state.store.create_user().await.expect("user");
        let app = build_api_router(state);

        let (status, _) = call(&app, "GET", "/debug/tasks", &token, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&app, "GET", "/debug/tasks", "admin-secret", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["tasks"].is_array());
    }

    #[tokio::test]
    async fn screenshots_are_served_as_png() {
        let state = test_state(None).await;
        let token = state.store.create_user().await.expect("user");
        let id = state
            .store
            .insert_screenshot(&[0x89, b'P', b'N', b'G'])
            .await
            .expect("screenshot");
        let app = build_api_router(state);

        let request = Request::builder()
            .uri(format!("/screenshot/{}", id))
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .expect("request should build");
        let response = app.clone().oneshot(request).await.expect("oneshot");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("image/png")
        );

        let (status, _) = call(&app, "GET", "/screenshot/nope", &token, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fill_requires_a_linked_course() {
        let state = test_state(None).await;
        let token = state.store.create_user().await.expect("user");
        let user = state
            .store
            .user_by_token(&token)
            .await
            .expect("lookup")
            .expect("user");
        state
            .store
            .set_credentials(&user.id, "123456", "ciphertext")
            .await
            .expect("credentials");
        let course = state
            .store
            .upsert_course("SCH3U1-4", "C. Teacher", Some("1-1a"))
            .await
            .expect("course");
        state
            .store
            .set_user_courses(&user.id, &[course.id.clone()])
            .await
            .expect("courses set");
        let app = build_api_router(state);

        let (status, _) = call(
            &app,
            "POST",
            "/test_fill",
            &token,
            Some(serde_json::json!({ "course_id": course.id })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
