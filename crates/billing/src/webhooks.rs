//! Stripe webhook handling
//!
//! Verifies inbound events against the raw body, records them in the webhook
//! ledger and routes them to the reconciliation handlers. Every handler is
//! idempotent, so a failed event is reported back as an error and the
//! processor's redelivery is allowed to re-run it.

use std::sync::Arc;

use uuid::Uuid;

use tierline_shared::format_cents;

use crate::activity::{ActivityBuilder, ActivityLogger, ActivityType};
use crate::error::BillingResult;
use crate::payloads::{
    metadata_uuid, EventKind, InvoiceObject, Metadata, ObjectRef, PaymentIntentObject,
    ProcessorEvent, SetupIntentObject, SubscriptionObject,
};
use crate::processor::metadata_keys;
use crate::purchase::PurchaseFinalizer;
use crate::revenue::RevenueLedger;
use crate::signature::SignatureVerifier;
use crate::store::{BillingStore, WebhookEventOutcome};
use crate::subscriptions::SubscriptionReconciler;

/// How an event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Already processed successfully; handlers were not re-run
    Duplicate,
    /// Event type is not handled
    Ignored,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    verifier: SignatureVerifier,
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionReconciler,
    finalizer: Arc<PurchaseFinalizer>,
    revenue: RevenueLedger,
    activity: ActivityLogger,
}

impl WebhookHandler {
    pub fn new(
        verifier: SignatureVerifier,
        store: Arc<dyn BillingStore>,
        finalizer: Arc<PurchaseFinalizer>,
    ) -> Self {
        Self {
            verifier,
            subscriptions: SubscriptionReconciler::new(store.clone(), finalizer.clone()),
            revenue: RevenueLedger::new(store.clone()),
            activity: ActivityLogger::new(store.clone()),
            finalizer,
            store,
        }
    }

    /// Verify the signature over the raw body, then parse the event
    pub fn verify_event(&self, payload: &[u8], signature: Option<&str>) -> BillingResult<ProcessorEvent> {
        self.verifier.verify(payload, signature)?;
        let event = ProcessorEvent::parse(payload)?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            livemode = event.livemode,
            "Verified webhook event"
        );
        Ok(event)
    }

    /// Verify and handle a raw webhook delivery
    pub async fn process(&self, payload: &[u8], signature: Option<&str>) -> BillingResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(&event).await
    }

    /// Handle a verified event
    pub async fn handle_event(&self, event: &ProcessorEvent) -> BillingResult<WebhookOutcome> {
        match self.store.webhook_event_status(&event.id).await {
            Ok(Some(WebhookEventOutcome::Success)) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event already processed, skipping"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            Ok(Some(WebhookEventOutcome::Error)) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Re-processing webhook event that previously failed"
                );
            }
            Ok(None) => {}
            Err(e) => {
                // Handlers are idempotent; proceed without the ledger
                tracing::warn!(event_id = %event.id, error = %e, "Failed to read webhook ledger");
            }
        }

        let result = self.dispatch(event).await;

        let (outcome, error_message) = match &result {
            Ok(_) => (WebhookEventOutcome::Success, None),
            Err(e) => (WebhookEventOutcome::Error, Some(e.to_string())),
        };
        if let Err(e) = self
            .store
            .record_webhook_event(&event.id, &event.event_type, outcome, error_message.as_deref())
            .await
        {
            tracing::warn!(event_id = %event.id, error = %e, "Failed to record webhook event");
        }

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                retryable = e.is_retryable(),
                "Webhook handler failed"
            );
        }
        result
    }

    async fn dispatch(&self, event: &ProcessorEvent) -> BillingResult<WebhookOutcome> {
        match event.kind() {
            EventKind::SetupIntentSucceeded => {
                let intent: SetupIntentObject = event.object()?;
                self.handle_setup_intent(event, &intent, true).await?;
            }
            EventKind::SetupIntentFailed => {
                let intent: SetupIntentObject = event.object()?;
                self.handle_setup_intent(event, &intent, false).await?;
            }
            EventKind::PaymentIntentProcessing => {
                let intent: PaymentIntentObject = event.object()?;
                self.handle_payment_processing(event, &intent).await?;
            }
            EventKind::PaymentIntentSucceeded => {
                let intent: PaymentIntentObject = event.object()?;
                self.handle_payment_succeeded(event, &intent).await?;
            }
            EventKind::PaymentIntentFailed => {
                let intent: PaymentIntentObject = event.object()?;
                self.handle_payment_failed(event, &intent).await?;
            }
            EventKind::SubscriptionCreated => {
                let subscription: SubscriptionObject = event.object()?;
                self.subscriptions.handle_created(event, &subscription).await?;
            }
            EventKind::SubscriptionUpdated => {
                let subscription: SubscriptionObject = event.object()?;
                self.subscriptions.handle_updated(event, &subscription).await?;
            }
            EventKind::SubscriptionDeleted => {
                let subscription: SubscriptionObject = event.object()?;
                self.subscriptions.handle_deleted(event, &subscription).await?;
            }
            EventKind::InvoicePaymentSucceeded => {
                let invoice: InvoiceObject = event.object()?;
                self.revenue.record_invoice_payment(event, &invoice).await?;
            }
            EventKind::InvoicePaymentFailed => {
                let invoice: InvoiceObject = event.object()?;
                self.handle_invoice_payment_failed(event, &invoice).await?;
            }
            EventKind::Unknown => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled webhook event type"
                );
                return Ok(WebhookOutcome::Ignored);
            }
        }
        Ok(WebhookOutcome::Processed)
    }

    /// Client from `clientId` metadata, else from the customer reference
    async fn resolve_client(
        &self,
        metadata: &Metadata,
        customer: Option<&ObjectRef>,
    ) -> BillingResult<Option<Uuid>> {
        if let Some(client_id) = metadata_uuid(metadata, metadata_keys::CLIENT_ID) {
            if self.store.get_client(client_id).await?.is_some() {
                return Ok(Some(client_id));
            }
        }
        match customer {
            Some(customer) => Ok(self
                .store
                .find_client_by_billing_reference(customer.id())
                .await?
                .map(|client| client.id)),
            None => Ok(None),
        }
    }

    async fn handle_setup_intent(
        &self,
        event: &ProcessorEvent,
        intent: &SetupIntentObject,
        succeeded: bool,
    ) -> BillingResult<()> {
        let Some(client_id) = self
            .resolve_client(&intent.metadata, intent.customer.as_ref())
            .await?
        else {
            tracing::warn!(setup_intent_id = %intent.id, "Setup intent for unknown client");
            return Ok(());
        };

        let builder = if succeeded {
            tracing::info!(client_id = %client_id, setup_intent_id = %intent.id, "Payment method saved");
            ActivityBuilder::new(client_id, ActivityType::PaymentMethodSaved, "Payment method saved")
        } else {
            let reason = intent
                .last_setup_error
                .as_ref()
                .and_then(|e| e.message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            tracing::warn!(
                client_id = %client_id,
                setup_intent_id = %intent.id,
                reason = %reason,
                "Payment method setup failed"
            );
            ActivityBuilder::new(
                client_id,
                ActivityType::PaymentMethodFailed,
                format!("Payment method could not be saved: {}", reason),
            )
        };

        self.activity
            .log(builder.field("stripe_setup_intent_id", &intent.id).stripe_event(&event.id))
            .await;
        Ok(())
    }

    async fn handle_payment_processing(
        &self,
        event: &ProcessorEvent,
        intent: &PaymentIntentObject,
    ) -> BillingResult<()> {
        let Some(client_id) = self
            .resolve_client(&intent.metadata, intent.customer.as_ref())
            .await?
        else {
            tracing::debug!(payment_intent_id = %intent.id, "Processing payment for unknown client");
            return Ok(());
        };

        self.activity
            .log(
                ActivityBuilder::new(
                    client_id,
                    ActivityType::PaymentProcessing,
                    format!("Payment of {} is processing", format_cents(intent.amount)),
                )
                .field("amount_cents", intent.amount)
                .stripe_payment_intent(&intent.id)
                .stripe_event(&event.id),
            )
            .await;
        Ok(())
    }

    async fn handle_payment_succeeded(
        &self,
        event: &ProcessorEvent,
        intent: &PaymentIntentObject,
    ) -> BillingResult<()> {
        if intent.invoice.is_some() {
            tracing::debug!(payment_intent_id = %intent.id, "Invoice payment intent, handled by invoice events");
            return Ok(());
        }

        let one_time = intent
            .metadata
            .get(metadata_keys::CHECKOUT_TYPE)
            .is_some_and(|t| t == metadata_keys::CHECKOUT_TYPE_ONETIME);
        if !one_time {
            tracing::debug!(payment_intent_id = %intent.id, "Payment intent not from checkout, ignoring");
            return Ok(());
        }

        self.finalizer.finalize_one_time(event, intent).await?;

        if let Some(client_id) = self
            .resolve_client(&intent.metadata, intent.customer.as_ref())
            .await?
        {
            let amount = if intent.amount_received > 0 {
                intent.amount_received
            } else {
                intent.amount
            };
            self.activity
                .log(
                    ActivityBuilder::new(
                        client_id,
                        ActivityType::PaymentSucceeded,
                        format!("Payment of {} received", format_cents(amount)),
                    )
                    .field("amount_cents", amount)
                    .stripe_payment_intent(&intent.id)
                    .stripe_event(&event.id),
                )
                .await;
        }
        Ok(())
    }

    async fn handle_payment_failed(
        &self,
        event: &ProcessorEvent,
        intent: &PaymentIntentObject,
    ) -> BillingResult<()> {
        let reason = intent
            .last_payment_error
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| "unknown error".to_string());

        let Some(client_id) = self
            .resolve_client(&intent.metadata, intent.customer.as_ref())
            .await?
        else {
            tracing::warn!(payment_intent_id = %intent.id, reason = %reason, "Payment failed for unknown client");
            return Ok(());
        };

        tracing::warn!(
            client_id = %client_id,
            payment_intent_id = %intent.id,
            reason = %reason,
            "Payment failed"
        );

        self.activity
            .log(
                ActivityBuilder::new(
                    client_id,
                    ActivityType::PaymentFailed,
                    format!("Payment of {} failed: {}", format_cents(intent.amount), reason),
                )
                .field("amount_cents", intent.amount)
                .field("reason", &reason)
                .stripe_payment_intent(&intent.id)
                .stripe_event(&event.id),
            )
            .await;
        Ok(())
    }

    async fn handle_invoice_payment_failed(
        &self,
        event: &ProcessorEvent,
        invoice: &InvoiceObject,
    ) -> BillingResult<()> {
        let Some(subscription_id) = invoice.subscription_id() else {
            return Ok(());
        };
        let Some(subscription) = self
            .store
            .get_subscription_by_external_ref(subscription_id)
            .await?
        else {
            tracing::debug!(invoice_id = %invoice.id, "Failed invoice for untracked subscription");
            return Ok(());
        };

        tracing::warn!(
            client_id = %subscription.client_id,
            invoice_id = %invoice.id,
            subscription_id = %subscription_id,
            "Invoice payment failed"
        );

        let detail = format!("Invoice {} payment failed", invoice.id);
        self.activity
            .log_subscription_history(subscription.id, "payment_failed", Some(detail.as_str()))
            .await;
        self.activity
            .log(
                ActivityBuilder::new(
                    subscription.client_id,
                    ActivityType::InvoicePaymentFailed,
                    format!("Invoice payment of {} failed", format_cents(invoice.total)),
                )
                .field("amount_cents", invoice.total)
                .stripe_invoice(&invoice.id)
                .stripe_subscription(subscription_id)
                .stripe_event(&event.id),
            )
            .await;
        Ok(())
    }
}

impl std::fmt::Debug for WebhookHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookHandler")
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}

