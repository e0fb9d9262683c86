#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tollbooth Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the Tollbooth
//! billing pipeline.

pub mod clock;
pub mod db;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::*;
pub use error::*;
pub use types::*;
