mod config;
mod core;
mod interfaces;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, warn};

use crate::config::Config;
use crate::core::pipeline::Pipeline;
use crate::core::scheduler::Scheduler;
use crate::core::storage::Store;
use crate::interfaces::web::ApiServer;

/// Geometry probes that never reported back age out after this long, so
/// a crashed probe can be requested again.
const GEOMETRY_PRUNE_AGE: chrono::Duration = chrono::Duration::minutes(15);

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(e) = run().await {
        error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // A missing or malformed vault key must stop the process here; without
    // it no stored credential can ever be decrypted.
    let config = Config::from_env()?;

    let store = Arc::new(Store::open(&config.db_path)?);
    let pipeline = Arc::new(Pipeline::new(config.clone(), store.clone()));
    let (scheduler, handle) = Scheduler::new(store.clone(), pipeline.clone(), config.workers);

    pipeline.schedule_check_day().await?;
    handle.poke();

    let prune_store = store.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(15 * 60));
        loop {
            tick.tick().await;
            let cutoff = chrono::Utc::now() - GEOMETRY_PRUNE_AGE;
            if let Err(e) = prune_store.geometry_prune(cutoff).await {
                warn!("geometry prune failed: {:#}", e);
            }
            // Backstop for test results whose cleanup task was lost.
            let test_cutoff = chrono::Utc::now() - core::pipeline::TEST_RESULT_TTL;
            if let Err(e) = prune_store.prune_test_results(test_cutoff).await {
                warn!("test result prune failed: {:#}", e);
            }
        }
    });

    let scheduler_task = tokio::spawn(scheduler.run());
    let server = ApiServer::new(config, store, pipeline, handle);

    tokio::select! {
        res = server.run() => res,
        res = scheduler_task => match res {
            Ok(res) => res,
            Err(e) => Err(anyhow::anyhow!("scheduler task panicked: {}", e)),
        },
    }
}
