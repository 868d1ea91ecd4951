//! Checkout initiation against the in-memory store and scripted processor

use tierline_billing::processor::{DiscountRef, SubscriptionItemRequest};
use tierline_billing::{BillingError, CartItem, CheckoutRequest};
use tierline_shared::{BillingCadence, SubscriptionStatus};

use crate::common::Harness;

fn monthly(name: &str, unit_price: i64, price_id: &str) -> CartItem {
    CartItem {
        name: name.to_string(),
        cadence: BillingCadence::Monthly,
        quantity: 1,
        unit_price,
        free_quantity: None,
        is_free: false,
        stripe_monthly_price_id: Some(price_id.to_string()),
        stripe_onetime_price_id: None,
    }
}

fn one_time(name: &str, unit_price: i64, price_id: &str) -> CartItem {
    CartItem {
        name: name.to_string(),
        cadence: BillingCadence::OneTime,
        quantity: 1,
        unit_price,
        free_quantity: None,
        is_free: false,
        stripe_monthly_price_id: None,
        stripe_onetime_price_id: Some(price_id.to_string()),
    }
}

fn request(client_id: uuid::Uuid, items: Vec<CartItem>) -> CheckoutRequest {
    CheckoutRequest {
        client_id,
        items,
        coupon_code: None,
        recommendation_id: None,
        selected_tier: Some("better".to_string()),
    }
}

#[tokio::test]
async fn test_checkout_builds_items_and_returns_secret() {
    let h = Harness::new();
    let client_id = h.seed_client(None);

    let mut seats = monthly("Seats", 10_000, "price_seats");
    seats.quantity = 3;
    seats.free_quantity = Some(1);
    let mut free_addon = monthly("Priority support", 2_500, "price_support");
    free_addon.is_free = true;

    let response = h
        .billing
        .checkout
        .create_subscription_checkout(request(
            client_id,
            vec![
                monthly("Better plan", 50_000, "price_better"),
                seats,
                free_addon,
                one_time("Onboarding", 15_000, "price_onboarding"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.subscription_id, "sub_fake_1");
    assert_eq!(response.client_secret.as_deref(), Some("pi_fake_1_secret"));
    assert_eq!(response.status, "incomplete");

    let sent = h.processor.last_subscription();
    assert_eq!(
        sent.items,
        vec![
            SubscriptionItemRequest {
                price_id: "price_better".to_string(),
                quantity: 1
            },
            SubscriptionItemRequest {
                price_id: "price_seats".to_string(),
                quantity: 2
            },
        ]
    );
    assert_eq!(sent.invoice_items.len(), 1);
    assert_eq!(sent.invoice_items[0].price_id, "price_onboarding");
    assert_eq!(sent.customer_id, "cus_fake_1");
    assert_eq!(sent.metadata.get("clientId"), Some(&client_id.to_string()));
    assert_eq!(sent.metadata.get("selectedTier").map(String::as_str), Some("better"));
}

#[tokio::test]
async fn test_one_time_only_cart_is_rejected_without_side_effects() {
    let h = Harness::new();
    let client_id = h.seed_client(None);

    let err = h
        .billing
        .checkout
        .create_subscription_checkout(request(
            client_id,
            vec![one_time("Onboarding", 15_000, "price_onboarding")],
        ))
        .await
        .unwrap_err();

    match err {
        BillingError::Validation(message) => assert!(message.contains("one-time checkout")),
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(h.processor.customer_count(), 0);
    assert_eq!(h.processor.subscription_count(), 0);
}

#[tokio::test]
async fn test_empty_cart_and_unknown_tier_are_rejected() {
    let h = Harness::new();
    let client_id = h.seed_client(None);

    let err = h
        .billing
        .checkout
        .create_subscription_checkout(request(client_id, vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let mut bad_tier = request(client_id, vec![monthly("Better plan", 50_000, "price_better")]);
    bad_tier.selected_tier = Some("platinum".to_string());
    let err = h
        .billing
        .checkout
        .create_subscription_checkout(bad_tier)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
    assert_eq!(h.processor.subscription_count(), 0);
}

#[tokio::test]
async fn test_unknown_client_is_not_found() {
    let h = Harness::new();
    let err = h
        .billing
        .checkout
        .create_subscription_checkout(request(
            uuid::Uuid::new_v4(),
            vec![monthly("Better plan", 50_000, "price_better")],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
}

#[tokio::test]
async fn test_unknown_discount_code_is_rejected_before_customer_creation() {
    let h = Harness::new();
    let client_id = h.seed_client(None);

    let mut req = request(client_id, vec![monthly("Better plan", 50_000, "price_better")]);
    req.coupon_code = Some("NOPE".to_string());
    let err = h
        .billing
        .checkout
        .create_subscription_checkout(req)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Validation(_)));
    assert_eq!(h.processor.customer_count(), 0);
}

#[tokio::test]
async fn test_known_discount_code_is_attached() {
    let h = Harness::new();
    let client_id = h.seed_client(Some("cus_existing"));
    h.processor
        .add_discount("SPRING20", DiscountRef::PromotionCode("promo_spring".to_string()));

    let mut req = request(client_id, vec![monthly("Better plan", 50_000, "price_better")]);
    req.coupon_code = Some(" SPRING20 ".to_string());
    h.billing
        .checkout
        .create_subscription_checkout(req)
        .await
        .unwrap();

    let sent = h.processor.last_subscription();
    assert_eq!(
        sent.discount,
        Some(DiscountRef::PromotionCode("promo_spring".to_string()))
    );
    assert_eq!(sent.customer_id, "cus_existing");
    assert_eq!(h.processor.customer_count(), 0);
}

#[tokio::test]
async fn test_customer_is_created_once_and_reused() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let items = vec![monthly("Better plan", 50_000, "price_better")];

    h.billing
        .checkout
        .create_subscription_checkout(request(client_id, items.clone()))
        .await
        .unwrap();
    h.billing
        .checkout
        .create_subscription_checkout(request(client_id, items))
        .await
        .unwrap();

    assert_eq!(h.processor.customer_count(), 1);
    assert_eq!(h.processor.last_subscription().customer_id, "cus_fake_1");
}

#[tokio::test]
async fn test_customer_persist_failure_does_not_fail_checkout() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    h.store.fail_operation("set_client_billing_reference");

    let response = h
        .billing
        .checkout
        .create_subscription_checkout(request(
            client_id,
            vec![monthly("Better plan", 50_000, "price_better")],
        ))
        .await
        .unwrap();

    assert_eq!(response.subscription_id, "sub_fake_1");
    assert_eq!(h.processor.last_subscription().customer_id, "cus_fake_1");
}

#[tokio::test]
async fn test_checkout_records_pending_subscription_for_recommendation() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);

    let mut req = request(client_id, vec![monthly("Better plan", 50_000, "price_better")]);
    req.recommendation_id = Some(recommendation_id);
    h.billing
        .checkout
        .create_subscription_checkout(req)
        .await
        .unwrap();

    let rows = h.store.subscriptions();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubscriptionStatus::Incomplete);
    assert_eq!(rows[0].recommendation_id, Some(recommendation_id));

    let history = h.store.subscription_history(rows[0].id);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].0, "created");

    assert_eq!(
        h.processor.last_subscription().metadata.get("recommendationId"),
        Some(&recommendation_id.to_string())
    );
}

#[tokio::test]
async fn test_processor_failure_surfaces_and_stores_nothing() {
    let h = Harness::new();
    let client_id = h.seed_client(Some("cus_existing"));
    let recommendation_id = h.seed_recommendation(client_id);
    h.processor.fail_subscription_create();

    let mut req = request(client_id, vec![monthly("Better plan", 50_000, "price_better")]);
    req.recommendation_id = Some(recommendation_id);
    let err = h
        .billing
        .checkout
        .create_subscription_checkout(req)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::PaymentProcessor { step: "create_subscription", .. }));
    assert!(h.store.subscriptions().is_empty());
}

#[tokio::test]
async fn test_one_time_checkout_creates_tagged_payment_intent() {
    let h = Harness::new();
    let client_id = h.seed_client(Some("cus_existing"));
    let recommendation_id = h.seed_recommendation(client_id);

    let mut onboarding = one_time("Onboarding", 15_000, "price_onboarding");
    onboarding.quantity = 2;
    let mut req = request(client_id, vec![onboarding]);
    req.recommendation_id = Some(recommendation_id);

    let response = h
        .billing
        .checkout
        .create_one_time_checkout(req)
        .await
        .unwrap();
    assert_eq!(response.payment_intent_id, "pi_onetime_1");

    let intents = h.processor.payment_intents.lock().unwrap();
    assert_eq!(intents[0].amount_cents, 30_000);
    assert_eq!(intents[0].customer_id, "cus_existing");
    assert_eq!(
        intents[0].metadata.get("checkoutType").map(String::as_str),
        Some("onetime")
    );
}

#[tokio::test]
async fn test_one_time_checkout_rejects_monthly_items_and_coupons() {
    let h = Harness::new();
    let client_id = h.seed_client(Some("cus_existing"));

    let err = h
        .billing
        .checkout
        .create_one_time_checkout(request(
            client_id,
            vec![monthly("Better plan", 50_000, "price_better")],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let mut req = request(client_id, vec![one_time("Onboarding", 15_000, "price_onboarding")]);
    req.coupon_code = Some("SPRING20".to_string());
    let err = h
        .billing
        .checkout
        .create_one_time_checkout(req)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
    assert!(h.processor.payment_intents.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_one_time_checkout_rejects_negative_prices_without_side_effects() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);

    let mut req = request(
        client_id,
        vec![
            one_time("Onboarding", 50_000, "price_onboarding"),
            one_time("Credit", -49_950, "price_credit"),
        ],
    );
    req.recommendation_id = Some(recommendation_id);

    let err = h
        .billing
        .checkout
        .create_one_time_checkout(req)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Validation(_)));
    assert!(h.processor.payment_intents.lock().unwrap().is_empty());
    assert_eq!(h.processor.customer_count(), 0);
}
