#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tollbooth API
//!
//! HTTP surface for the billing pipeline: the Stripe webhook endpoint, usage
//! and quota routes for metered services, and operator routes.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
