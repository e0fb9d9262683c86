#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tollbooth background worker
//!
//! Runs the webhook retry scheduler, usage aggregation and usage submission on
//! fixed schedules against the shared database.

mod jobs;

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::JobScheduler;
use tollbooth_api::{
    bootstrap::{build_pipeline, init_tracing},
    Config,
};

use crate::jobs::JobRunner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(config.log_json);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollbooth worker");

    let (pipeline, _pool) = build_pipeline(&config).await?;
    let runner = Arc::new(JobRunner::new(pipeline));

    let mut scheduler = JobScheduler::new()
        .await
        .context("failed to create job scheduler")?;
    jobs::register(&scheduler, runner)
        .await
        .context("failed to register jobs")?;
    scheduler.start().await.context("failed to start job scheduler")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    if let Err(e) = scheduler.shutdown().await {
        tracing::error!(error = %e, "Job scheduler did not shut down cleanly");
    }

    tracing::info!("Worker stopped");
    Ok(())
}
