//! Tierline API Library
//!
//! HTTP surface for the billing pipeline: checkout endpoints, the Stripe
//! webhook endpoint and health probes.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
