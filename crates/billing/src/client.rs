//! Stripe client configuration and the Stripe-backed payment processor

use async_trait::async_trait;
use stripe::{
    AddInvoiceItems, Client, Coupon, CouponId, CreateCustomer, CreatePaymentIntent,
    CreateSubscription, CreateSubscriptionItems, Currency, Customer, CustomerId, Expandable,
    Invoice, InvoiceId, ListPromotionCodes, PaymentIntent, PaymentIntentId, PromotionCode,
    StripeError, Subscription, SubscriptionPaymentBehavior,
};

use crate::error::{BillingError, BillingResult};
use crate::processor::{
    metadata_keys, CreateCustomerRequest, CreatePaymentIntentRequest, CreateSubscriptionRequest,
    CreatedSubscription, DiscountRef, InvoiceSummary, PaymentIntentHandle, PaymentIntentInfo,
    PaymentProcessor,
};

/// Default tolerance for webhook timestamps (5 minutes)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret. Webhooks are rejected with a
    /// configuration error while this is unset.
    pub webhook_secret: Option<String>,
    /// Maximum accepted age of a webhook signature timestamp
    pub webhook_tolerance_secs: i64,
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// Expansions for the subscription create call; the confirmation secret lives
/// on the first invoice's payment intent
const SUBSCRIPTION_EXPAND: &[&str] = &["latest_invoice.payment_intent"];

/// Invoice reads need no expansion: `discount` and its coupon come back inline,
/// and Stripe rejects expanding non-expandable fields
const INVOICE_EXPAND: &[&str] = &[];

fn is_not_found(err: &StripeError) -> bool {
    matches!(err, StripeError::Stripe(req) if req.http_status == 404)
}

fn payment_intent_info(intent: &PaymentIntent) -> PaymentIntentInfo {
    PaymentIntentInfo {
        id: intent.id.to_string(),
        status: intent.status.as_str().to_string(),
        client_secret: intent.client_secret.clone(),
        amount_cents: intent.amount,
    }
}

fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| BillingError::Internal(format!("Invalid customer ID: {}", e)))
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_customer(&self, request: CreateCustomerRequest) -> BillingResult<String> {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert(
            metadata_keys::CLIENT_ID.to_string(),
            request.client_id.to_string(),
        );
        metadata.insert("platform".to_string(), "tierline".to_string());

        let params = CreateCustomer {
            email: Some(&request.email),
            name: Some(&request.name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(&self.client, params)
            .await
            .map_err(|e| BillingError::processor("create_customer", e))?;

        Ok(customer.id.to_string())
    }

    async fn resolve_discount(&self, code: &str) -> BillingResult<Option<DiscountRef>> {
        // Customer-facing codes are promotion codes; fall back to a raw coupon id
        let mut list = ListPromotionCodes::new();
        list.code = Some(code);
        list.active = Some(true);
        list.limit = Some(1);

        let promotions = PromotionCode::list(&self.client, &list)
            .await
            .map_err(|e| BillingError::processor("resolve_discount", e))?;

        if let Some(promo) = promotions.data.first() {
            return Ok(Some(DiscountRef::PromotionCode(promo.id.to_string())));
        }

        let coupon_id = match code.parse::<CouponId>() {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };

        match Coupon::retrieve(&self.client, &coupon_id, &[]).await {
            Ok(coupon) if coupon.valid.unwrap_or(false) => {
                Ok(Some(DiscountRef::Coupon(coupon.id.to_string())))
            }
            Ok(_) => Ok(None),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(BillingError::processor("resolve_discount", e)),
        }
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<CreatedSubscription> {
        let customer_id = parse_customer_id(&request.customer_id)?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(
            request
                .items
                .iter()
                .map(|item| CreateSubscriptionItems {
                    price: Some(item.price_id.clone()),
                    quantity: Some(item.quantity),
                    ..Default::default()
                })
                .collect(),
        );
        if !request.invoice_items.is_empty() {
            params.add_invoice_items = Some(
                request
                    .invoice_items
                    .iter()
                    .map(|item| AddInvoiceItems {
                        price: Some(item.price_id.clone()),
                        quantity: Some(item.quantity),
                        ..Default::default()
                    })
                    .collect(),
            );
        }
        match &request.discount {
            Some(DiscountRef::Coupon(id)) => {
                params.coupon = Some(id.parse().map_err(|e| {
                    BillingError::Internal(format!("Invalid coupon ID: {}", e))
                })?);
            }
            Some(DiscountRef::PromotionCode(id)) => {
                params.promotion_code = Some(id.parse().map_err(|e| {
                    BillingError::Internal(format!("Invalid promotion code ID: {}", e))
                })?);
            }
            None => {}
        }
        params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        params.metadata = Some(request.metadata.clone());
        params.expand = SUBSCRIPTION_EXPAND;

        let subscription = Subscription::create(&self.client, params)
            .await
            .map_err(|e| BillingError::processor("create_subscription", e))?;

        let (latest_invoice_id, payment_intent) = match subscription.latest_invoice {
            Some(Expandable::Object(invoice)) => {
                let payment_intent = match &invoice.payment_intent {
                    Some(Expandable::Object(intent)) => {
                        Some(PaymentIntentHandle::Expanded(payment_intent_info(intent)))
                    }
                    Some(Expandable::Id(id)) => Some(PaymentIntentHandle::Reference(id.to_string())),
                    None => None,
                };
                (Some(invoice.id.to_string()), payment_intent)
            }
            Some(Expandable::Id(id)) => (Some(id.to_string()), None),
            None => (None, None),
        };

        Ok(CreatedSubscription {
            id: subscription.id.to_string(),
            status: subscription.status.as_str().to_string(),
            created: subscription.created,
            latest_invoice_id,
            payment_intent,
        })
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntentInfo> {
        let id = payment_intent_id
            .parse::<PaymentIntentId>()
            .map_err(|e| BillingError::Internal(format!("Invalid payment intent ID: {}", e)))?;

        let intent = PaymentIntent::retrieve(&self.client, &id, &[])
            .await
            .map_err(|e| BillingError::processor("retrieve_payment_intent", e))?;

        Ok(payment_intent_info(&intent))
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<InvoiceSummary> {
        let id = invoice_id
            .parse::<InvoiceId>()
            .map_err(|e| BillingError::Internal(format!("Invalid invoice ID: {}", e)))?;

        let invoice = Invoice::retrieve(&self.client, &id, INVOICE_EXPAND)
            .await
            .map_err(|e| BillingError::processor("retrieve_invoice", e))?;

        Ok(InvoiceSummary {
            id: invoice.id.to_string(),
            total_cents: invoice.total.unwrap_or(0),
            amount_paid_cents: invoice.amount_paid.unwrap_or(0),
            subtotal_cents: invoice.subtotal.unwrap_or(0),
            percent_off: invoice
                .discount
                .as_ref()
                .and_then(|discount| discount.coupon.percent_off),
        })
    }

    async fn create_payment_intent(
        &self,
        request: CreatePaymentIntentRequest,
    ) -> BillingResult<PaymentIntentInfo> {
        let mut params = CreatePaymentIntent::new(request.amount_cents, Currency::USD);
        params.customer = Some(parse_customer_id(&request.customer_id)?);
        params.description = request.description.as_deref();
        params.metadata = Some(request.metadata.clone());

        let intent = PaymentIntent::create(&self.client, params)
            .await
            .map_err(|e| BillingError::processor("create_payment_intent", e))?;

        Ok(payment_intent_info(&intent))
    }
}
