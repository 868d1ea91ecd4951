//! Billing persistence port
//!
//! One trait covers every table the reconciliation pipeline touches. The
//! Postgres adapter is used in production; the in-memory adapter backs tests
//! and local development.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use tierline_shared::{RecommendationStatus, RevenueChangeType, SubscriptionStatus, Tier};

use crate::error::BillingResult;

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Clients

    async fn get_client(&self, client_id: Uuid) -> BillingResult<Option<Client>>;

    /// Persist the billing reference only if the client has none yet.
    /// Returns the reference stored after the call.
    async fn set_client_billing_reference(
        &self,
        client_id: Uuid,
        stripe_customer_id: &str,
    ) -> BillingResult<String>;

    async fn find_client_by_billing_reference(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<Client>>;

    // Recommendations

    async fn get_recommendation(&self, recommendation_id: Uuid)
        -> BillingResult<Option<Recommendation>>;

    /// Mark a recommendation purchased and append its history entry.
    ///
    /// Conditional on the recommendation not being `accepted` yet; returns
    /// `false` without writing anything when it already is.
    async fn finalize_recommendation(
        &self,
        recommendation_id: Uuid,
        tier: Tier,
        purchased_at: OffsetDateTime,
        history_detail: &str,
    ) -> BillingResult<bool>;

    // Subscriptions

    async fn get_subscription_by_external_ref(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert or update the row keyed by the external subscription reference.
    /// Updates older than the row's last observed event are rejected.
    async fn upsert_subscription(
        &self,
        upsert: SubscriptionUpsert,
    ) -> BillingResult<SubscriptionUpsertOutcome>;

    async fn append_subscription_history(
        &self,
        subscription_id: Uuid,
        action: &str,
        details: Option<&str>,
    ) -> BillingResult<()>;

    // Revenue

    async fn get_revenue(&self, client_id: Uuid, month: Date)
        -> BillingResult<Option<RevenueRecord>>;

    /// Replace the record for `(client_id, month)`
    async fn upsert_revenue(&self, record: &RevenueRecord) -> BillingResult<()>;

    // Activity

    async fn append_activity(&self, entry: &ActivityEntry) -> BillingResult<()>;

    // Webhook ledger

    async fn webhook_event_status(&self, event_id: &str)
        -> BillingResult<Option<WebhookEventOutcome>>;

    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        outcome: WebhookEventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub stripe_customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub client_id: Uuid,
    pub status: RecommendationStatus,
    pub purchased_tier: Option<Tier>,
    pub purchased_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub stripe_subscription_id: String,
    pub client_id: Uuid,
    pub recommendation_id: Option<Uuid>,
    pub stripe_customer_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    /// Creation time of the newest processor event applied to this row
    pub last_event_at: OffsetDateTime,
}

/// Processor-reported subscription state to apply locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpsert {
    pub stripe_subscription_id: String,
    pub client_id: Uuid,
    pub recommendation_id: Option<Uuid>,
    pub stripe_customer_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    /// When the processor produced this state
    pub observed_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpsertOutcome {
    /// Row as stored after the call
    pub record: SubscriptionRecord,
    /// Status before the call; `None` when the row was inserted
    pub previous_status: Option<SubscriptionStatus>,
    pub inserted: bool,
    /// `false` when the update was rejected as stale or as leaving a terminal status
    pub applied: bool,
}

impl SubscriptionUpsertOutcome {
    /// Whether this call moved the row into `status` from a different one
    pub fn entered(&self, status: SubscriptionStatus) -> bool {
        self.applied && self.record.status == status && self.previous_status != Some(status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueRecord {
    pub client_id: Uuid,
    /// First day of the calendar month
    pub month: Date,
    pub mrr_cents: i64,
    pub change_type: RevenueChangeType,
    pub change_amount_cents: i64,
    pub stripe_invoice_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub client_id: Uuid,
    pub activity_type: String,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventOutcome {
    Success,
    Error,
}

impl WebhookEventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Decide whether `update` may overwrite `current`.
///
/// Older observations lose. Observations from the same second only win if
/// they are a forward lifecycle step. Terminal statuses are final.
pub(crate) fn accepts_update(current: &SubscriptionRecord, update: &SubscriptionUpsert) -> bool {
    if current.status.is_terminal() && update.status != current.status {
        return false;
    }
    if update.observed_at < current.last_event_at {
        return false;
    }
    if update.observed_at == current.last_event_at {
        return current.status.can_transition_to(update.status);
    }
    true
}

/// Apply an accepted update on top of the stored row
pub(crate) fn merge_update(current: &SubscriptionRecord, update: &SubscriptionUpsert) -> SubscriptionRecord {
    SubscriptionRecord {
        id: current.id,
        stripe_subscription_id: current.stripe_subscription_id.clone(),
        client_id: current.client_id,
        recommendation_id: update.recommendation_id.or(current.recommendation_id),
        stripe_customer_id: update.stripe_customer_id.clone(),
        status: update.status,
        current_period_start: update.current_period_start,
        current_period_end: update.current_period_end,
        canceled_at: update.canceled_at,
        last_event_at: update.observed_at,
    }
}
