use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;
use crate::core::types::User;

/// Who a validated bearer token belongs to. Inserted into request
/// extensions by [`require_auth`].
#[derive(Clone)]
pub(crate) enum Caller {
    Admin,
    User(User),
}

impl Caller {
    pub(crate) fn user(&self) -> Option<&User> {
        match self {
            Caller::User(user) => Some(user),
            Caller::Admin => None,
        }
    }

    pub(crate) fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }
}

pub(crate) fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "missing or invalid bearer token" })),
    )
        .into_response()
}

pub(crate) fn admin_only() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "this endpoint requires the admin token" })),
    )
        .into_response()
}

/// Only a user token may call endpoints that act on "the calling user".
pub(crate) fn user_only() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "this endpoint requires a user token" })),
    )
        .into_response()
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    let Some(token) = token else {
        return unauthorized();
    };

    if let Some(admin_token) = &state.admin_token {
        if &token == admin_token {
            req.extensions_mut().insert(Caller::Admin);
            return next.run(req).await;
        }
    }

    match state.store.user_by_token(&token).await {
        Ok(Some(user)) => {
            req.extensions_mut().insert(Caller::User(user));
            next.run(req).await
        }
        Ok(None) => unauthorized(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::pipeline::Pipeline;
    use crate::core::scheduler::{Scheduler, TaskOutcome, TaskRunner};
    use crate::core::storage::Store;
    use crate::core::types::Task;
    use axum::{Router, middleware, routing::get};
    use serde_json::json;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    struct NopRunner;

    #[async_trait::async_trait]
    impl TaskRunner for NopRunner {
        async fn run(&self, _task: &Task) -> TaskOutcome {
            TaskOutcome::Done
        }
    }

    pub(crate) async fn test_state(admin_token: Option<&str>) -> AppState {
        let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
        let config = crate::config::Config {
            credential_key: [7u8; 32],
            school_code: None,
            submit_enabled: false,
            db_path: ":memory:".into(),
            api_host: "127.0.0.1".into(),
            api_port: 0,
            school_base_url: "http://127.0.0.1:1".into(),
            webdriver_url: "http://127.0.0.1:1".into(),
            workers: 1,
            admin_token: admin_token.map(str::to_string),
        };
        let pipeline = Arc::new(Pipeline::new(config, store.clone()));
        let (scheduler, handle) = Scheduler::new(store.clone(), Arc::new(NopRunner), 1);
        tokio::spawn(scheduler.run());
        AppState {
            store,
            pipeline,
            scheduler: handle,
            admin_token: admin_token.map(str::to_string),
        }
    }

    fn protected_app(state: AppState) -> Router {
        Router::new()
            .route(
                "/ping",
                get(|| async { Json(json!({ "ok": true })).into_response() }),
            )
            .layer(middleware::from_fn_with_state(
                state.clone(),
                super::require_auth,
            ))
            .with_state(state)
    }

    async fn ping_status(app: Router, auth_header: Option<String>) -> StatusCode {
        let mut builder = Request::builder().uri("/ping");
        if let Some(value) = auth_header {
            builder = builder.header("authorization", value);
        }
        let req = builder.body(Body::empty()).expect("request should build");
        app.oneshot(req)
            .await
            .expect("oneshot should succeed")
            .status()
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let state = test_state(None).await;
        let app = protected_app(state);
        assert_eq!(ping_status(app, None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let state = test_state(Some("admin-secret")).await;
        let app = protected_app(state);
        let status = ping_status(app, Some("Bearer nope".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn user_token_is_accepted() {
        let state = test_state(None).await;
        let token = state.store.create_user().await.expect("user");
        let app = protected_app(state);
        let status = ping_status(app, Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_token_is_accepted() {
        let state = test_state(Some("admin-secret")).await;
        let app = protected_app(state);
        let status = ping_status(app, Some("Bearer admin-secret".into())).await;
        assert_eq!(status, StatusCode::OK);
    }
}
