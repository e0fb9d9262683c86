//! Shared application state

use sqlx::PgPool;
use std::sync::Arc;
use tollbooth_billing::BillingPipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<BillingPipeline>,
    /// `None` when running on the in-memory store
    pub pool: Option<PgPool>,
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pipeline: Arc<BillingPipeline>, pool: Option<PgPool>) -> Self {
        Self {
            pipeline,
            pool,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.map(Arc::from);
        self
    }
}
