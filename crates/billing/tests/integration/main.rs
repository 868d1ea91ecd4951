//! Billing pipeline integration tests
//!
//! Run the full checkout and webhook flows against the in-memory store and a
//! scripted payment processor. No database or network access is needed.
//!
//! ```bash
//! cargo test -p tierline-billing --test integration
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod checkout_flow;
mod common;
mod purchase_flow;
