pub(crate) mod auth;
mod handlers;
mod router;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::core::pipeline::Pipeline;
use crate::core::scheduler::SchedulerHandle;
use crate::core::storage::Store;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<Store>,
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) scheduler: SchedulerHandle,
    pub(crate) admin_token: Option<String>,
}

pub struct ApiServer {
    store: Arc<Store>,
    pipeline: Arc<Pipeline>,
    scheduler: SchedulerHandle,
    config: Config,
}

impl ApiServer {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        pipeline: Arc<Pipeline>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            store,
            pipeline,
            scheduler,
            config,
        }
    }

    pub async fn run(self) -> Result<()> {
        let state = AppState {
            store: self.store,
            pipeline: self.pipeline,
            scheduler: self.scheduler,
            admin_token: self.config.admin_token.clone(),
        };
        let app = router::build_api_router(state);
        let addr = format!("{}:{}", self.config.api_host, self.config.api_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind API server to {}", addr))?;
        info!("API server listening on {}", addr);
        axum::serve(listener, app).await.context("API server exited")
    }
}
