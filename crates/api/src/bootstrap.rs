//! Process startup shared by the API server and the worker

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tollbooth_billing::{
    BillingPipeline, CacheBackend, PipelineStores, RedisCacheBackend, StripeClient, StripeConfig,
    StripeUsageReporter,
};
use tollbooth_shared::{create_pool, run_migrations, SystemClock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tollbooth=debug,sqlx=warn"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Connect to Postgres, migrate, and wire the pipeline against it
pub async fn build_pipeline(config: &Config) -> anyhow::Result<(Arc<BillingPipeline>, PgPool)> {
    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("Database ready");

    let clock = Arc::new(SystemClock);
    let stripe = StripeClient::new(StripeConfig {
        secret_key: config.stripe_secret_key.clone(),
        webhook_secret: config.stripe_webhook_secret.clone(),
    });
    let reporter = Arc::new(StripeUsageReporter::new(stripe, clock.clone()));

    let mut builder = BillingPipeline::builder(
        PipelineStores::postgres(pool.clone()),
        reporter,
        config.stripe_webhook_secret.clone(),
    )
    .clock(clock)
    .config(config.pipeline.clone());

    if let Some(url) = &config.redis_url {
        match RedisCacheBackend::connect(url).await {
            Ok(redis) => {
                tracing::info!("Usage cache backed by Redis");
                builder = builder.cache_backend(Arc::new(redis) as Arc<dyn CacheBackend>);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Redis unavailable, usage cache running in process memory"
                );
            }
        }
    }

    let pipeline = builder.build().context("invalid pipeline configuration")?;
    Ok((Arc::new(pipeline), pool))
}
