//! Webhook payload types
//!
//! Only the fields the reconciliation handlers read are captured; everything
//! else in Stripe's payload is ignored. Objects are parsed per event type so
//! an unknown event type never fails deserialization.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A verified webhook event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix creation time
    pub created: i64,
    pub data: EventData,
    #[serde(default)]
    pub livemode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProcessorEvent {
    pub fn parse(payload: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| BillingError::MalformedPayload(format!("invalid event: {}", e)))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Deserialize `data.object` as `T`
    pub fn object<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::MalformedPayload(format!("invalid {} object: {}", self.event_type, e))
        })
    }
}

/// Event types the dispatcher routes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SetupIntentSucceeded,
    SetupIntentFailed,
    PaymentIntentProcessing,
    PaymentIntentSucceeded,
    PaymentIntentFailed,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Unknown,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "setup_intent.succeeded" => Self::SetupIntentSucceeded,
            "setup_intent.setup_failed" => Self::SetupIntentFailed,
            "payment_intent.processing" => Self::PaymentIntentProcessing,
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => Self::PaymentIntentFailed,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            _ => Self::Unknown,
        }
    }
}

/// A reference that Stripe may send as a bare id or as an expanded object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Object { id: String },
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            ObjectRef::Id(id) => id,
            ObjectRef::Object { id } => id,
        }
    }
}

pub type Metadata = HashMap<String, String>;

/// Read a UUID from metadata; absent, empty and malformed values are `None`
pub fn metadata_uuid(metadata: &Metadata, key: &str) -> Option<Uuid> {
    metadata
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(|v| Uuid::parse_str(v).ok())
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: ObjectRef,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub latest_invoice: Option<ObjectRef>,
    #[serde(default)]
    pub items: ItemList<SubscriptionItemObject>,
    #[serde(default)]
    pub discount: Option<DiscountObject>,
}

impl SubscriptionObject {
    /// Billing period, read from the subscription or, on newer API versions,
    /// from its first item
    pub fn period(&self) -> (Option<i64>, Option<i64>) {
        let first = self.items.data.first();
        (
            self.current_period_start
                .or_else(|| first.and_then(|item| item.current_period_start)),
            self.current_period_end
                .or_else(|| first.and_then(|item| item.current_period_end)),
        )
    }

    /// Sum of `unit_amount × quantity` over the subscription items
    pub fn items_total(&self) -> i64 {
        self.items
            .data
            .iter()
            .map(|item| {
                let unit = item.price.as_ref().and_then(|p| p.unit_amount).unwrap_or(0);
                let quantity = i64::try_from(item.quantity.unwrap_or(1)).unwrap_or(i64::MAX);
                unit.saturating_mul(quantity)
            })
            .fold(0i64, i64::saturating_add)
    }

    pub fn percent_off(&self) -> Option<f64> {
        self.discount
            .as_ref()
            .and_then(|d| d.coupon.as_ref())
            .and_then(|c| c.percent_off)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for ItemList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItemObject {
    #[serde(default)]
    pub price: Option<PriceObject>,
    #[serde(default)]
    pub quantity: Option<u64>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceObject {
    pub id: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountObject {
    #[serde(default)]
    pub coupon: Option<CouponObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponObject {
    #[serde(default)]
    pub percent_off: Option<f64>,
}

// =============================================================================
// Invoices
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub status_transitions: Option<StatusTransitions>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
}

impl InvoiceObject {
    /// Subscription this invoice bills, on old and new API shapes alike
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(ObjectRef::id).or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_ref())
                .map(ObjectRef::id)
        })
    }

    pub fn paid_at(&self) -> Option<i64> {
        self.status_transitions.as_ref().and_then(|t| t.paid_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransitions {
    #[serde(default)]
    pub paid_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
}

// =============================================================================
// Payment and setup intents
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_received: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub invoice: Option<ObjectRef>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub last_payment_error: Option<ErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupIntentObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub last_setup_error: Option<ErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    #[serde(default)]
    pub message: Option<String>,
}
