//! API routes

pub mod admin;
pub mod health;
pub mod quota;
pub mod usage;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Stripe payloads are small; anything past this is not a real webhook
const WEBHOOK_BODY_LIMIT: usize = 512 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Stripe webhook (public, uses signature verification)
    let webhook_routes = Router::new()
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT));

    // Called by metered services inside the trust boundary
    let tenant_routes = Router::new()
        .route("/tenants/:tenant_id/usage", get(usage::get_usage))
        .route("/tenants/:tenant_id/usage-events", post(usage::record_usage_event))
        .route("/tenants/:tenant_id/quota/:metric/check", post(quota::check_quota));

    let admin_routes = Router::new()
        .route("/dead-letters", get(admin::list_dead_letters))
        .route("/dead-letters/replay", post(admin::replay_all))
        .route("/dead-letters/:id", get(admin::get_dead_letter))
        .route("/dead-letters/:id/replay", post(admin::replay_dead_letter))
        .route("/jobs/retry", post(admin::run_retry_job))
        .route("/jobs/aggregate", post(admin::run_aggregation_job))
        .route("/jobs/submit", post(admin::run_sink_job))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin::require_admin));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .nest("/v1", tenant_routes)
        .nest("/admin", admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
