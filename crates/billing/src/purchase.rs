//! Purchase finalization
//!
//! Marks the originating recommendation purchased the first time its
//! subscription (or one-time payment) is confirmed. The write is conditional
//! on the recommendation not being accepted yet, so redelivered or later
//! "still active" events leave it untouched.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use tierline_shared::{RecommendationStatus, Tier};

use crate::activity::{purchase_description, ActivityBuilder, ActivityLogger, ActivityType};
use crate::error::BillingResult;
use crate::payloads::{metadata_uuid, Metadata, PaymentIntentObject, ProcessorEvent, SubscriptionObject};
use crate::processor::{metadata_keys, PaymentProcessor};
use crate::store::BillingStore;

/// What was paid, as shown to the client
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaidAmount {
    pub amount_cents: i64,
    pub percent_off: Option<f64>,
    /// Amount before the discount, when a discount applied
    pub original_cents: Option<i64>,
}

/// Reconstruct the pre-discount amount from the paid amount.
///
/// A 100% discount cannot be inverted; `fallback_cents` (the undiscounted
/// subtotal) is used instead when it is known.
pub fn pre_discount_amount(paid_cents: i64, percent_off: f64, fallback_cents: Option<i64>) -> Option<i64> {
    if percent_off.is_nan() || percent_off <= 0.0 {
        return None;
    }
    if percent_off >= 100.0 {
        return fallback_cents.filter(|c| *c > 0);
    }
    let original = (paid_cents as f64 / (1.0 - percent_off / 100.0)).round();
    // No TryFrom<f64> for i64; only convert values that fit in cents
    if !original.is_finite() || original < 0.0 || original >= i64::MAX as f64 {
        return None;
    }
    Some(original as i64)
}

/// Recommendation and tier correlated through processor metadata
struct PurchaseTarget {
    recommendation_id: Uuid,
    tier: Tier,
}

pub struct PurchaseFinalizer {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    activity: ActivityLogger,
}

impl PurchaseFinalizer {
    pub fn new(store: Arc<dyn BillingStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self {
            activity: ActivityLogger::new(store.clone()),
            store,
            processor,
        }
    }

    /// Finalize the purchase behind a subscription the processor reports active
    pub async fn finalize_subscription(
        &self,
        event: &ProcessorEvent,
        subscription: &SubscriptionObject,
    ) -> BillingResult<()> {
        let Some(target) = purchase_target(&event.id, &subscription.metadata) else {
            return Ok(());
        };
        if self.already_finalized(target.recommendation_id).await? {
            return Ok(());
        }

        let paid = self.subscription_amount(subscription).await;
        self.finalize(
            event,
            &target,
            paid,
            true,
            ("stripe_subscription_id", subscription.id.as_str()),
        )
        .await
    }

    /// Finalize a one-time-only checkout once its payment intent succeeded
    pub async fn finalize_one_time(
        &self,
        event: &ProcessorEvent,
        intent: &PaymentIntentObject,
    ) -> BillingResult<()> {
        let Some(target) = purchase_target(&event.id, &intent.metadata) else {
            return Ok(());
        };
        if self.already_finalized(target.recommendation_id).await? {
            return Ok(());
        }

        let amount_cents = if intent.amount_received > 0 {
            intent.amount_received
        } else {
            intent.amount
        };
        let paid = PaidAmount {
            amount_cents,
            percent_off: None,
            original_cents: None,
        };
        self.finalize(
            event,
            &target,
            paid,
            false,
            ("stripe_payment_intent_id", intent.id.as_str()),
        )
        .await
    }

    async fn already_finalized(&self, recommendation_id: Uuid) -> BillingResult<bool> {
        match self.store.get_recommendation(recommendation_id).await? {
            None => {
                tracing::error!(
                    recommendation_id = %recommendation_id,
                    "Recommendation from processor metadata does not exist"
                );
                Ok(true)
            }
            Some(recommendation) if recommendation.status == RecommendationStatus::Accepted => {
                tracing::debug!(
                    recommendation_id = %recommendation_id,
                    "Recommendation already purchased, skipping finalization"
                );
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Paid amount from the latest invoice, or from the subscription items
    /// when the invoice cannot be fetched
    async fn subscription_amount(&self, subscription: &SubscriptionObject) -> PaidAmount {
        let items_total = subscription.items_total();

        let invoice = match &subscription.latest_invoice {
            Some(invoice_ref) => match self.processor.retrieve_invoice(invoice_ref.id()).await {
                Ok(invoice) => Some(invoice),
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        invoice_id = %invoice_ref.id(),
                        error = %e,
                        "Failed to retrieve latest invoice, using subscription items total"
                    );
                    None
                }
            },
            None => None,
        };

        let (amount_cents, percent_off, subtotal) = match invoice {
            Some(invoice) => (
                invoice.total_cents,
                invoice.percent_off.or_else(|| subscription.percent_off()),
                Some(invoice.subtotal_cents),
            ),
            None => (items_total, subscription.percent_off(), Some(items_total)),
        };

        PaidAmount {
            amount_cents,
            percent_off,
            original_cents: percent_off.and_then(|pct| pre_discount_amount(amount_cents, pct, subtotal)),
        }
    }

    async fn finalize(
        &self,
        event: &ProcessorEvent,
        target: &PurchaseTarget,
        paid: PaidAmount,
        recurring: bool,
        processor_ref: (&str, &str),
    ) -> BillingResult<()> {
        let discount = paid.percent_off.zip(paid.original_cents);
        let description = purchase_description(target.tier, paid.amount_cents, recurring, discount);

        let finalized = self
            .store
            .finalize_recommendation(
                target.recommendation_id,
                target.tier,
                OffsetDateTime::now_utc(),
                &description,
            )
            .await?;

        if !finalized {
            tracing::info!(
                recommendation_id = %target.recommendation_id,
                event_id = %event.id,
                "Recommendation was finalized concurrently"
            );
            return Ok(());
        }

        tracing::info!(
            recommendation_id = %target.recommendation_id,
            tier = %target.tier,
            amount_cents = paid.amount_cents,
            percent_off = ?paid.percent_off,
            "Recommendation purchased"
        );

        let recommendation = match self.store.get_recommendation(target.recommendation_id).await {
            Ok(recommendation) => recommendation,
            Err(e) => {
                tracing::error!(
                    recommendation_id = %target.recommendation_id,
                    error = %e,
                    "Failed to load purchased recommendation for activity entry"
                );
                None
            }
        };
        if let Some(recommendation) = recommendation {
            self.activity
                .log(
                    ActivityBuilder::new(
                        recommendation.client_id,
                        ActivityType::PurchaseCompleted,
                        description,
                    )
                    .field("recommendation_id", target.recommendation_id)
                    .field("tier", target.tier)
                    .field("amount_cents", paid.amount_cents)
                    .field("percent_off", paid.percent_off)
                    .field("original_amount_cents", paid.original_cents)
                    .field(processor_ref.0, processor_ref.1)
                    .stripe_event(&event.id),
                )
                .await;
        }

        Ok(())
    }
}

/// Read the recommendation and tier from metadata.
///
/// Checkouts without a recommendation are not tracked. Metadata that names a
/// recommendation but cannot be used is logged; redelivery cannot repair it.
fn purchase_target(event_id: &str, metadata: &Metadata) -> Option<PurchaseTarget> {
    let raw_recommendation = metadata
        .get(metadata_keys::RECOMMENDATION_ID)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())?;

    let Some(recommendation_id) = metadata_uuid(metadata, metadata_keys::RECOMMENDATION_ID) else {
        tracing::error!(
            event_id = %event_id,
            recommendation_id = %raw_recommendation,
            "Malformed recommendation id in processor metadata"
        );
        return None;
    };

    let tier = metadata
        .get(metadata_keys::SELECTED_TIER)
        .and_then(|t| t.parse::<Tier>().ok());
    let Some(tier) = tier else {
        tracing::error!(
            event_id = %event_id,
            recommendation_id = %recommendation_id,
            selected_tier = ?metadata.get(metadata_keys::SELECTED_TIER),
            "Missing or invalid tier in processor metadata; cannot finalize purchase"
        );
        return None;
    };

    Some(PurchaseTarget {
        recommendation_id,
        tier,
    })
}
