// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // StripeError is carried through BillingError conversions
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tierline Billing Module
//!
//! Connects recommendation purchases to Stripe and keeps local records in
//! step with what Stripe reports.
//!
//! ## Features
//!
//! - **Checkout**: Build line items from a cart, resolve discounts and customers,
//!   create an incomplete subscription and return its confirmation secret
//! - **Webhooks**: Verify and route Stripe events, with an idempotency ledger
//! - **Subscription reconciliation**: Upsert local subscription state, ignoring
//!   out-of-order events
//! - **Purchase finalization**: Mark a recommendation purchased exactly once
//! - **Revenue**: One monthly recurring revenue record per client and month
//! - **Activity**: Client-facing activity log and subscription history

pub mod activity;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod line_items;
pub mod payloads;
pub mod processor;
pub mod purchase;
pub mod revenue;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

use std::sync::Arc;

use sqlx::PgPool;

// Activity
pub use activity::{ActivityBuilder, ActivityLogger, ActivityType};

// Checkout
pub use checkout::{CheckoutRequest, CheckoutResponse, CheckoutService, OneTimeCheckoutResponse};

// Client
pub use client::{StripeClient, StripeConfig, DEFAULT_WEBHOOK_TOLERANCE_SECS};

// Customer
pub use customer::CustomerResolver;

// Error
pub use error::{BillingError, BillingResult};

// Line items
pub use line_items::{build_line_items, one_time_total, CartItem, LineItems};

// Payloads
pub use payloads::{EventKind, ProcessorEvent};

// Processor port
pub use processor::PaymentProcessor;

// Purchase
pub use purchase::{pre_discount_amount, PaidAmount, PurchaseFinalizer};

// Revenue
pub use revenue::RevenueLedger;

// Signature
pub use signature::{sign_payload, SignatureVerifier};

// Store port
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{LifecycleEvent, SubscriptionReconciler};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

/// Main billing service that combines checkout and webhook handling
pub struct BillingService {
    pub checkout: CheckoutService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a billing service backed by Postgres with explicit Stripe config
    pub fn with_stripe(stripe: StripeClient, pool: PgPool) -> Self {
        let verifier = SignatureVerifier::new(
            stripe.config().webhook_secret.clone(),
            stripe.config().webhook_tolerance_secs,
        );
        Self::new(Arc::new(PgBillingStore::new(pool)), Arc::new(stripe), verifier)
    }

    /// Create a billing service over any store and processor
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        verifier: SignatureVerifier,
    ) -> Self {
        let finalizer = Arc::new(PurchaseFinalizer::new(store.clone(), processor.clone()));

        Self {
            checkout: CheckoutService::new(store.clone(), processor),
            webhooks: WebhookHandler::new(verifier, store, finalizer),
        }
    }
}
