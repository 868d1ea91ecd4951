//! Shared fixtures: a scripted payment processor, seeded store and signed
//! webhook delivery

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use tierline_billing::processor::{
    CreateCustomerRequest, CreatePaymentIntentRequest, CreateSubscriptionRequest,
    CreatedSubscription, DiscountRef, InvoiceSummary, PaymentIntentHandle, PaymentIntentInfo,
};
use tierline_billing::store::{Client, Recommendation};
use tierline_billing::{
    sign_payload, BillingError, BillingResult, BillingService, BillingStore,
    InMemoryBillingStore, PaymentProcessor, SignatureVerifier, WebhookOutcome,
};
use tierline_shared::RecommendationStatus;

pub const WEBHOOK_SECRET: &str = "whsec_integration_secret";
pub const CUSTOMER_ID: &str = "cus_test_1";

/// Payment processor double that records calls and serves scripted objects
#[derive(Default)]
pub struct FakeProcessor {
    pub customers: Mutex<Vec<CreateCustomerRequest>>,
    pub subscriptions: Mutex<Vec<CreateSubscriptionRequest>>,
    pub payment_intents: Mutex<Vec<CreatePaymentIntentRequest>>,
    discounts: Mutex<HashMap<String, DiscountRef>>,
    invoices: Mutex<HashMap<String, InvoiceSummary>>,
    fail_subscription: Mutex<bool>,
}

impl FakeProcessor {
    pub fn add_discount(&self, code: &str, discount: DiscountRef) {
        self.discounts.lock().unwrap().insert(code.to_string(), discount);
    }

    pub fn add_invoice(&self, invoice: InvoiceSummary) {
        self.invoices.lock().unwrap().insert(invoice.id.clone(), invoice);
    }

    pub fn fail_subscription_create(&self) {
        *self.fail_subscription.lock().unwrap() = true;
    }

    pub fn customer_count(&self) -> usize {
        self.customers.lock().unwrap().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    pub fn last_subscription(&self) -> CreateSubscriptionRequest {
        self.subscriptions.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_customer(&self, request: CreateCustomerRequest) -> BillingResult<String> {
        let mut customers = self.customers.lock().unwrap();
        customers.push(request);
        Ok(format!("cus_fake_{}", customers.len()))
    }

    async fn resolve_discount(&self, code: &str) -> BillingResult<Option<DiscountRef>> {
        Ok(self.discounts.lock().unwrap().get(code).cloned())
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<CreatedSubscription> {
        if *self.fail_subscription.lock().unwrap() {
            return Err(BillingError::processor("create_subscription", "card_declined"));
        }
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.push(request);
        let n = subscriptions.len();
        Ok(CreatedSubscription {
            id: format!("sub_fake_{}", n),
            status: "incomplete".to_string(),
            created: OffsetDateTime::now_utc().unix_timestamp() - 60,
            latest_invoice_id: Some(format!("in_fake_{}", n)),
            payment_intent: Some(PaymentIntentHandle::Expanded(PaymentIntentInfo {
                id: format!("pi_fake_{}", n),
                status: "requires_payment_method".to_string(),
                client_secret: Some(format!("pi_fake_{}_secret", n)),
                amount_cents: 0,
            })),
        })
    }

    async fn retrieve_payment_intent(&self, payment_intent_id: &str) -> BillingResult<PaymentIntentInfo> {
        Ok(PaymentIntentInfo {
            id: payment_intent_id.to_string(),
            status: "requires_payment_method".to_string(),
            client_secret: Some(format!("{}_secret", payment_intent_id)),
            amount_cents: 0,
        })
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<InvoiceSummary> {
        self.invoices
            .lock()
            .unwrap()
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| BillingError::processor("retrieve_invoice", "No such invoice"))
    }

    async fn create_payment_intent(
        &self,
        request: CreatePaymentIntentRequest,
    ) -> BillingResult<PaymentIntentInfo> {
        let amount_cents = request.amount_cents;
        let mut intents = self.payment_intents.lock().unwrap();
        intents.push(request);
        let id = format!("pi_onetime_{}", intents.len());
        Ok(PaymentIntentInfo {
            client_secret: Some(format!("{}_secret", id)),
            id,
            status: "requires_payment_method".to_string(),
            amount_cents,
        })
    }
}

pub struct Harness {
    pub store: Arc<InMemoryBillingStore>,
    pub processor: Arc<FakeProcessor>,
    pub billing: BillingService,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let processor = Arc::new(FakeProcessor::default());
        let billing = BillingService::new(
            store.clone(),
            processor.clone(),
            SignatureVerifier::new(Some(WEBHOOK_SECRET.to_string()), 300),
        );
        Self {
            store,
            processor,
            billing,
        }
    }

    /// Seed a client, optionally with an existing customer reference
    pub fn seed_client(&self, stripe_customer_id: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_client(Client {
            id,
            name: "Acme Dental".to_string(),
            email: "office@acme.test".to_string(),
            stripe_customer_id: stripe_customer_id.map(str::to_string),
        });
        id
    }

    pub fn seed_recommendation(&self, client_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_recommendation(Recommendation {
            id,
            client_id,
            status: RecommendationStatus::Sent,
            purchased_tier: None,
            purchased_at: None,
        });
        id
    }

    pub async fn recommendation(&self, id: Uuid) -> Recommendation {
        self.store.get_recommendation(id).await.unwrap().unwrap()
    }

    /// Sign and deliver an event as the processor would
    pub async fn deliver(&self, event: &Value) -> BillingResult<WebhookOutcome> {
        let payload = serde_json::to_vec(event).unwrap();
        let header = sign_payload(&payload, WEBHOOK_SECRET, now()).unwrap();
        self.billing.webhooks.process(&payload, Some(&header)).await
    }
}

pub fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn event(id: &str, event_type: &str, created: i64, object: Value) -> Value {
    json!({
        "id": id,
        "object": "event",
        "type": event_type,
        "created": created,
        "livemode": false,
        "data": { "object": object }
    })
}

/// Metadata written by checkout
pub fn checkout_metadata(client_id: Uuid, recommendation_id: Uuid, tier: &str) -> Value {
    json!({
        "clientId": client_id.to_string(),
        "recommendationId": recommendation_id.to_string(),
        "selectedTier": tier
    })
}

pub fn subscription(id: &str, status: &str, metadata: Value) -> Value {
    json!({
        "id": id,
        "object": "subscription",
        "customer": CUSTOMER_ID,
        "status": status,
        "current_period_start": 1_767_225_600,
        "current_period_end": 1_769_904_000,
        "canceled_at": null,
        "latest_invoice": format!("in_{}", id),
        "metadata": metadata,
        "items": {
            "object": "list",
            "data": [
                { "price": { "id": "price_better_monthly", "unit_amount": 50_000 }, "quantity": 1 }
            ]
        }
    })
}

pub fn paid_invoice(id: &str, subscription_id: &str, amount_paid: i64, billing_reason: &str, paid_at: i64) -> Value {
    json!({
        "id": id,
        "object": "invoice",
        "subscription": subscription_id,
        "customer": CUSTOMER_ID,
        "amount_paid": amount_paid,
        "total": amount_paid,
        "billing_reason": billing_reason,
        "status_transitions": { "paid_at": paid_at }
    })
}
