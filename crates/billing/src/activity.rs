//! Client activity log
//!
//! Append-only, human-readable entries describing payment lifecycle events.
//! They feed the client-facing activity feed and support tooling. Writing an
//! entry never fails the operation that produced it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use tierline_shared::{format_cents, Tier};

use crate::store::{ActivityEntry, BillingStore};

/// Types of activity entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityType {
    // Purchases
    PurchaseCompleted,

    // Payment methods
    PaymentMethodSaved,
    PaymentMethodFailed,

    // Payments
    PaymentProcessing,
    PaymentSucceeded,
    PaymentFailed,
    InvoicePaymentFailed,

    // Subscription lifecycle
    SubscriptionCanceled,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::PurchaseCompleted => "purchase_completed",
            ActivityType::PaymentMethodSaved => "payment_method_saved",
            ActivityType::PaymentMethodFailed => "payment_method_failed",
            ActivityType::PaymentProcessing => "payment_processing",
            ActivityType::PaymentSucceeded => "payment_succeeded",
            ActivityType::PaymentFailed => "payment_failed",
            ActivityType::InvoicePaymentFailed => "invoice_payment_failed",
            ActivityType::SubscriptionCanceled => "subscription_canceled",
        }
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builder for activity entries
pub struct ActivityBuilder {
    client_id: Uuid,
    activity_type: ActivityType,
    description: String,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl ActivityBuilder {
    pub fn new(client_id: Uuid, activity_type: ActivityType, description: impl Into<String>) -> Self {
        Self {
            client_id,
            activity_type,
            description: description.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Attach a structured metadata field
    pub fn field(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.metadata.insert(key.to_string(), value);
        }
        self
    }

    pub fn stripe_event(self, event_id: &str) -> Self {
        self.field("stripe_event_id", event_id)
    }

    pub fn stripe_subscription(self, subscription_id: &str) -> Self {
        self.field("stripe_subscription_id", subscription_id)
    }

    pub fn stripe_invoice(self, invoice_id: &str) -> Self {
        self.field("stripe_invoice_id", invoice_id)
    }

    pub fn stripe_payment_intent(self, payment_intent_id: &str) -> Self {
        self.field("stripe_payment_intent_id", payment_intent_id)
    }

    pub fn build(self) -> ActivityEntry {
        ActivityEntry {
            client_id: self.client_id,
            activity_type: self.activity_type.to_string(),
            description: self.description,
            metadata: if self.metadata.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(self.metadata))
            },
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Purchase summary line, e.g. `Purchased Better plan for $500.00/month`.
///
/// With a discount: `... for $400.00/month (20% off $500.00)`.
pub fn purchase_description(
    tier: Tier,
    amount_cents: i64,
    recurring: bool,
    discount: Option<(f64, i64)>,
) -> String {
    let cadence = if recurring { "/month" } else { "" };
    let mut description = format!(
        "Purchased {} plan for {}{}",
        tier.label(),
        format_cents(amount_cents),
        cadence
    );
    if let Some((percent_off, original_cents)) = discount {
        description.push_str(&format!(
            " ({}% off {})",
            format_percent(percent_off),
            format_cents(original_cents)
        ));
    }
    description
}

fn format_percent(percent: f64) -> String {
    if percent.fract() == 0.0 {
        format!("{}", percent as i64)
    } else {
        format!("{:.2}", percent)
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }
}

/// Appends activity entries through the billing store
#[derive(Clone)]
pub struct ActivityLogger {
    store: Arc<dyn BillingStore>,
}

impl ActivityLogger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Append an entry. Failures are logged and swallowed.
    pub async fn log(&self, builder: ActivityBuilder) {
        let entry = builder.build();
        if let Err(e) = self.store.append_activity(&entry).await {
            tracing::error!(
                client_id = %entry.client_id,
                activity_type = %entry.activity_type,
                error = %e,
                "Failed to write activity log entry"
            );
        }
    }

    /// Append a subscription history entry. Failures are logged and swallowed.
    pub async fn log_subscription_history(
        &self,
        subscription_id: Uuid,
        action: &str,
        details: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .append_subscription_history(subscription_id, action, details)
            .await
        {
            tracing::error!(
                subscription_id = %subscription_id,
                action = action,
                error = %e,
                "Failed to write subscription history entry"
            );
        }
    }
}
