//! Payment processor port
//!
//! Everything the pipeline asks of the external payment processor. The
//! production implementation is [`crate::client::StripeClient`]; tests script
//! their own implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BillingResult;

/// Metadata keys written on processor objects and read back from webhooks
pub mod metadata_keys {
    pub const CLIENT_ID: &str = "clientId";
    pub const RECOMMENDATION_ID: &str = "recommendationId";
    pub const SELECTED_TIER: &str = "selectedTier";
    pub const CHECKOUT_TYPE: &str = "checkoutType";

    /// `CHECKOUT_TYPE` value for one-time-only payments
    pub const CHECKOUT_TYPE_ONETIME: &str = "onetime";
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create a billing identity; returns the processor's customer reference
    async fn create_customer(&self, request: CreateCustomerRequest) -> BillingResult<String>;

    /// Resolve a user-entered discount code. `None` when the code is unknown.
    async fn resolve_discount(&self, code: &str) -> BillingResult<Option<DiscountRef>>;

    /// Create a subscription that waits for explicit payment confirmation
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<CreatedSubscription>;

    async fn retrieve_payment_intent(&self, payment_intent_id: &str)
        -> BillingResult<PaymentIntentInfo>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<InvoiceSummary>;

    /// Create a standalone payment intent (one-time-only checkout)
    async fn create_payment_intent(
        &self,
        request: CreatePaymentIntentRequest,
    ) -> BillingResult<PaymentIntentInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCustomerRequest {
    pub client_id: Uuid,
    pub name: String,
    pub email: String,
}

/// A discount the processor understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscountRef {
    Coupon(String),
    PromotionCode(String),
}

/// Recurring line on the subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionItemRequest {
    pub price_id: String,
    pub quantity: u64,
}

/// One-time line billed on the subscription's first invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceItemRequest {
    pub price_id: String,
    pub quantity: u64,
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub customer_id: String,
    pub items: Vec<SubscriptionItemRequest>,
    pub invoice_items: Vec<InvoiceItemRequest>,
    pub discount: Option<DiscountRef>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreatedSubscription {
    pub id: String,
    /// Raw processor status string
    pub status: String,
    /// Unix creation time at the processor
    pub created: i64,
    pub latest_invoice_id: Option<String>,
    /// Payment intent of the first invoice, if the invoice has one
    pub payment_intent: Option<PaymentIntentHandle>,
}

/// The first invoice's payment intent, either returned inline or only by id
#[derive(Debug, Clone)]
pub enum PaymentIntentHandle {
    Expanded(PaymentIntentInfo),
    Reference(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentInfo {
    pub id: String,
    pub status: String,
    pub client_secret: Option<String>,
    pub amount_cents: i64,
}

/// The parts of an invoice the purchase finalizer needs
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceSummary {
    pub id: String,
    pub total_cents: i64,
    pub amount_paid_cents: i64,
    pub subtotal_cents: i64,
    /// Percent-off of the applied coupon, if any
    pub percent_off: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CreatePaymentIntentRequest {
    pub customer_id: String,
    pub amount_cents: i64,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}
