//! Checkout initiation
//!
//! Creates a subscription that waits for client-side payment confirmation and
//! hands back the confirmation secret. The purchase itself is only recorded
//! once the processor reports the subscription active (see `subscriptions`).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use tierline_shared::{from_unix, SubscriptionStatus, Tier};

use crate::activity::ActivityLogger;
use crate::customer::CustomerResolver;
use crate::error::{BillingError, BillingResult};
use crate::line_items::{build_line_items, one_time_total, CartItem};
use crate::processor::{
    metadata_keys, CreatePaymentIntentRequest, CreateSubscriptionRequest, CreatedSubscription,
    DiscountRef, PaymentIntentHandle, PaymentProcessor,
};
use crate::store::{BillingStore, SubscriptionUpsert};

/// Checkout request from the client UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub client_id: Uuid,
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub recommendation_id: Option<Uuid>,
    #[serde(default)]
    pub selected_tier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    /// Secret the UI uses to confirm the first payment
    pub client_secret: Option<String>,
    pub subscription_id: String,
    pub payment_intent_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeCheckoutResponse {
    pub client_secret: Option<String>,
    pub payment_intent_id: String,
    pub status: String,
}

/// Checkout service
pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    customers: CustomerResolver,
    activity: ActivityLogger,
}

impl CheckoutService {
    pub fn new(store: Arc<dyn BillingStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self {
            customers: CustomerResolver::new(store.clone(), processor.clone()),
            activity: ActivityLogger::new(store.clone()),
            store,
            processor,
        }
    }

    /// Start a subscription checkout.
    ///
    /// Validation happens before any processor call. After the subscription
    /// exists at the processor, local bookkeeping failures are logged and do
    /// not fail the checkout.
    pub async fn create_subscription_checkout(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        let client_id = request.client_id;

        if request.items.is_empty() {
            return Err(BillingError::Validation("Cart is empty".to_string()));
        }
        let tier = parse_selected_tier(request.selected_tier.as_deref())?;
        let line_items = build_line_items(&request.items)?;

        let client = self.customers.get_client(client_id).await?;
        let discount = self.resolve_discount(client_id, request.coupon_code.as_deref()).await?;
        let customer_id = self.customers.resolve(&client).await?;

        let metadata = checkout_metadata(client_id, request.recommendation_id, tier, None);

        let subscription = self
            .processor
            .create_subscription(CreateSubscriptionRequest {
                customer_id: customer_id.clone(),
                items: line_items.subscription_items,
                invoice_items: line_items.invoice_items,
                discount,
                metadata,
            })
            .await
            .map_err(|e| log_processor_failure(client_id, "create_subscription", e))?;

        let (payment_intent_id, client_secret) =
            self.confirmation_secret(client_id, &subscription).await?;

        if let Some(recommendation_id) = request.recommendation_id {
            self.record_pending_subscription(client_id, recommendation_id, &customer_id, &subscription)
                .await;
        }

        tracing::info!(
            client_id = %client_id,
            subscription_id = %subscription.id,
            recommendation_id = ?request.recommendation_id,
            monthly_total = line_items.monthly_total,
            onetime_total = line_items.onetime_total,
            "Created checkout subscription"
        );

        Ok(CheckoutResponse {
            client_secret,
            subscription_id: subscription.id,
            payment_intent_id,
            status: subscription.status,
        })
    }

    /// Start a checkout for a cart with only one-time items.
    ///
    /// The purchase is finalized when the payment intent succeeds.
    pub async fn create_one_time_checkout(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<OneTimeCheckoutResponse> {
        let client_id = request.client_id;

        if request.items.is_empty() {
            return Err(BillingError::Validation("Cart is empty".to_string()));
        }
        if request
            .coupon_code
            .as_deref()
            .is_some_and(|code| !code.trim().is_empty())
        {
            return Err(BillingError::Validation(
                "Discount codes apply to subscription checkouts only".to_string(),
            ));
        }
        let tier = parse_selected_tier(request.selected_tier.as_deref())?;
        let amount_cents = one_time_total(&request.items)?;

        let client = self.customers.get_client(client_id).await?;
        let customer_id = self.customers.resolve(&client).await?;

        let metadata = checkout_metadata(
            client_id,
            request.recommendation_id,
            tier,
            Some(metadata_keys::CHECKOUT_TYPE_ONETIME),
        );

        let intent = self
            .processor
            .create_payment_intent(CreatePaymentIntentRequest {
                customer_id,
                amount_cents,
                description: Some(match tier {
                    Some(tier) => format!("{} plan one-time purchase", tier.label()),
                    None => "One-time purchase".to_string(),
                }),
                metadata,
            })
            .await
            .map_err(|e| log_processor_failure(client_id, "create_payment_intent", e))?;

        tracing::info!(
            client_id = %client_id,
            payment_intent_id = %intent.id,
            amount_cents = amount_cents,
            "Created one-time checkout"
        );

        Ok(OneTimeCheckoutResponse {
            client_secret: intent.client_secret,
            payment_intent_id: intent.id,
            status: intent.status,
        })
    }

    async fn resolve_discount(
        &self,
        client_id: Uuid,
        code: Option<&str>,
    ) -> BillingResult<Option<DiscountRef>> {
        let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };

        match self.processor.resolve_discount(code).await {
            Ok(Some(discount)) => Ok(Some(discount)),
            Ok(None) => Err(BillingError::Validation(format!(
                "Discount code '{}' is not valid",
                code
            ))),
            Err(e) => Err(log_processor_failure(client_id, "resolve_discount", e)),
        }
    }

    /// Payment intent id and client secret of the first invoice
    async fn confirmation_secret(
        &self,
        client_id: Uuid,
        subscription: &CreatedSubscription,
    ) -> BillingResult<(Option<String>, Option<String>)> {
        match &subscription.payment_intent {
            Some(PaymentIntentHandle::Expanded(intent)) => {
                Ok((Some(intent.id.clone()), intent.client_secret.clone()))
            }
            Some(PaymentIntentHandle::Reference(id)) => {
                let intent = self
                    .processor
                    .retrieve_payment_intent(id)
                    .await
                    .map_err(|e| log_processor_failure(client_id, "retrieve_payment_intent", e))?;
                Ok((Some(intent.id), intent.client_secret))
            }
            None => {
                tracing::warn!(
                    client_id = %client_id,
                    subscription_id = %subscription.id,
                    "First invoice has no payment intent"
                );
                Ok((None, None))
            }
        }
    }

    async fn record_pending_subscription(
        &self,
        client_id: Uuid,
        recommendation_id: Uuid,
        customer_id: &str,
        subscription: &CreatedSubscription,
    ) {
        let status = SubscriptionStatus::from_processor(&subscription.status)
            .unwrap_or(SubscriptionStatus::Incomplete);
        let observed_at = from_unix(subscription.created).unwrap_or_else(|_| OffsetDateTime::now_utc());

        let upsert = SubscriptionUpsert {
            stripe_subscription_id: subscription.id.clone(),
            client_id,
            recommendation_id: Some(recommendation_id),
            stripe_customer_id: customer_id.to_string(),
            status,
            current_period_start: None,
            current_period_end: None,
            canceled_at: None,
            observed_at,
        };

        match self.store.upsert_subscription(upsert).await {
            Ok(outcome) if outcome.inserted => {
                self.activity
                    .log_subscription_history(
                        outcome.record.id,
                        "created",
                        Some("Subscription created at checkout"),
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    client_id = %client_id,
                    subscription_id = %subscription.id,
                    step = "persist_subscription",
                    error = %e,
                    "Subscription created at processor but not stored locally"
                );
            }
        }
    }
}

fn parse_selected_tier(label: Option<&str>) -> BillingResult<Option<Tier>> {
    match label.map(str::trim).filter(|l| !l.is_empty()) {
        None => Ok(None),
        Some(label) => label
            .parse::<Tier>()
            .map(Some)
            .map_err(|_| BillingError::Validation(format!("Unknown tier '{}'", label))),
    }
}

fn checkout_metadata(
    client_id: Uuid,
    recommendation_id: Option<Uuid>,
    tier: Option<Tier>,
    checkout_type: Option<&str>,
) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(metadata_keys::CLIENT_ID.to_string(), client_id.to_string());
    if let Some(recommendation_id) = recommendation_id {
        metadata.insert(
            metadata_keys::RECOMMENDATION_ID.to_string(),
            recommendation_id.to_string(),
        );
    }
    if let Some(tier) = tier {
        metadata.insert(metadata_keys::SELECTED_TIER.to_string(), tier.to_string());
    }
    if let Some(checkout_type) = checkout_type {
        metadata.insert(
            metadata_keys::CHECKOUT_TYPE.to_string(),
            checkout_type.to_string(),
        );
    }
    metadata
}

fn log_processor_failure(client_id: Uuid, step: &'static str, err: BillingError) -> BillingError {
    tracing::error!(
        client_id = %client_id,
        step = step,
        error = %err,
        "Payment processor call failed during checkout"
    );
    err
}
