// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tierline Shared Types and Utilities
//!
//! Domain vocabulary (tiers, statuses, money and calendar helpers) and database
//! plumbing shared by the billing pipeline and the API server.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
