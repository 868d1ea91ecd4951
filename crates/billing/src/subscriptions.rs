//! Subscription lifecycle reconciliation
//!
//! Applies processor-reported subscription state to the local row keyed by
//! the external subscription id. The processor is authoritative: status,
//! period and cancellation fields are overwritten from each event, except
//! that events older than the last applied one are ignored.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use tierline_shared::{from_unix, SubscriptionStatus};

use crate::activity::{ActivityBuilder, ActivityLogger, ActivityType};
use crate::error::BillingResult;
use crate::payloads::{metadata_uuid, ProcessorEvent, SubscriptionObject};
use crate::processor::metadata_keys;
use crate::purchase::PurchaseFinalizer;
use crate::store::{BillingStore, SubscriptionUpsert, SubscriptionUpsertOutcome};

/// Which lifecycle event is being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created,
    Updated,
    Deleted,
}

pub struct SubscriptionReconciler {
    store: Arc<dyn BillingStore>,
    activity: ActivityLogger,
    finalizer: Arc<PurchaseFinalizer>,
}

impl SubscriptionReconciler {
    pub fn new(store: Arc<dyn BillingStore>, finalizer: Arc<PurchaseFinalizer>) -> Self {
        Self {
            activity: ActivityLogger::new(store.clone()),
            store,
            finalizer,
        }
    }

    pub async fn handle_created(
        &self,
        event: &ProcessorEvent,
        subscription: &SubscriptionObject,
    ) -> BillingResult<()> {
        self.apply(event, subscription, LifecycleEvent::Created).await?;
        Ok(())
    }

    /// Apply an update; finalizes the purchase when the processor reports the
    /// subscription active
    pub async fn handle_updated(
        &self,
        event: &ProcessorEvent,
        subscription: &SubscriptionObject,
    ) -> BillingResult<()> {
        self.apply(event, subscription, LifecycleEvent::Updated).await?;

        if SubscriptionStatus::from_processor(&subscription.status) == Some(SubscriptionStatus::Active)
        {
            self.finalizer.finalize_subscription(event, subscription).await?;
        }
        Ok(())
    }

    pub async fn handle_deleted(
        &self,
        event: &ProcessorEvent,
        subscription: &SubscriptionObject,
    ) -> BillingResult<()> {
        self.apply(event, subscription, LifecycleEvent::Deleted).await?;
        Ok(())
    }

    /// Upsert the local row from the event. `None` when the subscription
    /// cannot be tied to a client or its status has no local equivalent.
    pub async fn apply(
        &self,
        event: &ProcessorEvent,
        subscription: &SubscriptionObject,
        lifecycle: LifecycleEvent,
    ) -> BillingResult<Option<SubscriptionUpsertOutcome>> {
        let observed_at = from_unix(event.created)?;

        let status = match lifecycle {
            LifecycleEvent::Deleted => SubscriptionStatus::Canceled,
            _ => match SubscriptionStatus::from_processor(&subscription.status) {
                Some(status) => status,
                None => {
                    tracing::info!(
                        subscription_id = %subscription.id,
                        status = %subscription.status,
                        "Subscription status has no local equivalent, ignoring"
                    );
                    return Ok(None);
                }
            },
        };

        let Some(client_id) = self.resolve_client(subscription).await? else {
            tracing::warn!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                customer_id = %subscription.customer.id(),
                "Subscription cannot be tied to a client, ignoring"
            );
            return Ok(None);
        };

        let (period_start, period_end) = subscription.period();
        let canceled_at = match (subscription.canceled_at, lifecycle) {
            (Some(ts), _) => Some(from_unix(ts)?),
            (None, LifecycleEvent::Deleted) => Some(observed_at),
            (None, _) => None,
        };

        let upsert = SubscriptionUpsert {
            stripe_subscription_id: subscription.id.clone(),
            client_id,
            recommendation_id: metadata_uuid(&subscription.metadata, metadata_keys::RECOMMENDATION_ID),
            stripe_customer_id: subscription.customer.id().to_string(),
            status,
            current_period_start: period_start.map(from_unix).transpose()?,
            current_period_end: period_end.map(from_unix).transpose()?,
            canceled_at,
            observed_at,
        };

        let outcome = self.store.upsert_subscription(upsert).await?;

        if !outcome.applied {
            tracing::info!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                reported_status = %status,
                stored_status = %outcome.record.status,
                "Ignoring out-of-date subscription event"
            );
            return Ok(Some(outcome));
        }

        tracing::info!(
            event_id = %event.id,
            subscription_id = %subscription.id,
            client_id = %client_id,
            previous_status = ?outcome.previous_status,
            status = %outcome.record.status,
            "Reconciled subscription"
        );

        self.record_transition(&outcome, event, observed_at).await;
        Ok(Some(outcome))
    }

    async fn resolve_client(&self, subscription: &SubscriptionObject) -> BillingResult<Option<Uuid>> {
        if let Some(existing) = self
            .store
            .get_subscription_by_external_ref(&subscription.id)
            .await?
        {
            return Ok(Some(existing.client_id));
        }

        if let Some(client_id) = metadata_uuid(&subscription.metadata, metadata_keys::CLIENT_ID) {
            if self.store.get_client(client_id).await?.is_some() {
                return Ok(Some(client_id));
            }
            tracing::warn!(
                client_id = %client_id,
                subscription_id = %subscription.id,
                "Client from subscription metadata does not exist"
            );
        }

        Ok(self
            .store
            .find_client_by_billing_reference(subscription.customer.id())
            .await?
            .map(|client| client.id))
    }

    async fn record_transition(
        &self,
        outcome: &SubscriptionUpsertOutcome,
        event: &ProcessorEvent,
        observed_at: OffsetDateTime,
    ) {
        let record = &outcome.record;

        if outcome.inserted {
            let detail = format!("Created from event {}", event.id);
            self.activity
                .log_subscription_history(record.id, "created", Some(detail.as_str()))
                .await;
        }

        if outcome.entered(SubscriptionStatus::Active) {
            match outcome.previous_status {
                None | Some(SubscriptionStatus::Incomplete) => {
                    self.activity
                        .log_subscription_history(
                            record.id,
                            "activated",
                            Some("Subscription activated"),
                        )
                        .await;
                }
                Some(SubscriptionStatus::PastDue) => {
                    self.activity
                        .log_subscription_history(
                            record.id,
                            "reactivated",
                            Some("Past-due payment recovered"),
                        )
                        .await;
                }
                Some(_) => {}
            }
        }

        if outcome.entered(SubscriptionStatus::Canceled) {
            let detail = format!("Canceled at {}", record.canceled_at.unwrap_or(observed_at));
            self.activity
                .log_subscription_history(record.id, "canceled", Some(detail.as_str()))
                .await;
            self.activity
                .log(
                    ActivityBuilder::new(
                        record.client_id,
                        ActivityType::SubscriptionCanceled,
                        "Subscription canceled",
                    )
                    .stripe_subscription(&record.stripe_subscription_id)
                    .stripe_event(&event.id),
                )
                .await;
        }
    }
}
