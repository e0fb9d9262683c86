//! Tollbooth API server

use anyhow::Context;
use tokio::net::TcpListener;
use tollbooth_api::{
    bootstrap::{build_pipeline, init_tracing},
    create_router, AppState, Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(config.log_json);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollbooth API");

    let (pipeline, pool) = build_pipeline(&config).await?;

    if pipeline.spawn_dispatch_worker().is_none() {
        tracing::warn!("Dispatch worker already running");
    }

    let state =
        AppState::new(pipeline, Some(pool)).with_admin_token(config.admin_api_token.clone());
    if state.admin_token.is_none() {
        tracing::info!("ADMIN_API_TOKEN not set, operator routes disabled");
    }

    let app = create_router(state);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}
