//! Subscription reconciliation, purchase finalization and revenue

use serde_json::json;

use tierline_billing::processor::InvoiceSummary;
use tierline_billing::{CartItem, CheckoutRequest, WebhookOutcome};
use tierline_shared::{BillingCadence, RecommendationStatus, RevenueChangeType, SubscriptionStatus, Tier};

use crate::common::{checkout_metadata, event, now, paid_invoice, subscription, Harness};

fn invoice_summary(id: &str, total: i64, subtotal: i64, percent_off: Option<f64>) -> InvoiceSummary {
    InvoiceSummary {
        id: id.to_string(),
        total_cents: total,
        amount_paid_cents: total,
        subtotal_cents: subtotal,
        percent_off,
    }
}

#[tokio::test]
async fn test_checkout_to_purchase_end_to_end() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);

    let plan = CartItem {
        name: "Better plan".to_string(),
        cadence: BillingCadence::Monthly,
        quantity: 1,
        unit_price: 50_000,
        free_quantity: None,
        is_free: false,
        stripe_monthly_price_id: Some("price_better_monthly".to_string()),
        stripe_onetime_price_id: None,
    };
    let addon = CartItem {
        name: "Review monitoring".to_string(),
        unit_price: 9_900,
        is_free: true,
        stripe_monthly_price_id: Some("price_reviews".to_string()),
        ..plan.clone()
    };

    let checkout = h
        .billing
        .checkout
        .create_subscription_checkout(CheckoutRequest {
            client_id,
            items: vec![plan, addon],
            coupon_code: None,
            recommendation_id: Some(recommendation_id),
            selected_tier: Some("better".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(h.processor.last_subscription().items.len(), 1);

    let sub_id = checkout.subscription_id.clone();
    h.processor
        .add_invoice(invoice_summary(&format!("in_{}", sub_id), 50_000, 50_000, None));
    let metadata = checkout_metadata(client_id, recommendation_id, "better");
    let t0 = now();

    h.deliver(&event(
        "evt_created",
        "customer.subscription.created",
        t0,
        subscription(&sub_id, "incomplete", metadata.clone()),
    ))
    .await
    .unwrap();
    assert_eq!(
        h.recommendation(recommendation_id).await.status,
        RecommendationStatus::Sent
    );

    h.deliver(&event(
        "evt_active",
        "customer.subscription.updated",
        t0 + 5,
        subscription(&sub_id, "active", metadata),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_invoice",
        "invoice.payment_succeeded",
        t0 + 5,
        paid_invoice(&format!("in_{}", sub_id), &sub_id, 50_000, "subscription_create", t0 + 5),
    ))
    .await
    .unwrap();

    let recommendation = h.recommendation(recommendation_id).await;
    assert_eq!(recommendation.status, RecommendationStatus::Accepted);
    assert_eq!(recommendation.purchased_tier, Some(Tier::Better));
    assert!(recommendation.purchased_at.is_some());

    let rows = h.store.subscriptions();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubscriptionStatus::Active);
    let actions: Vec<String> = h
        .store
        .subscription_history(rows[0].id)
        .into_iter()
        .map(|(action, _)| action)
        .collect();
    assert_eq!(actions, vec!["created", "activated"]);

    let activity = h.store.activities(client_id);
    let purchase = activity
        .iter()
        .find(|a| a.activity_type == "purchase_completed")
        .unwrap();
    assert_eq!(purchase.description, "Purchased Better plan for $500.00/month");

    let revenue = h.store.revenue_records();
    assert_eq!(revenue.len(), 1);
    assert_eq!(revenue[0].mrr_cents, 50_000);
    assert_eq!(revenue[0].change_type, RevenueChangeType::New);
    assert_eq!(revenue[0].change_amount_cents, 50_000);
}

#[tokio::test]
async fn test_repeated_active_events_finalize_once() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);
    h.processor
        .add_invoice(invoice_summary("in_sub_1", 50_000, 50_000, None));
    let metadata = checkout_metadata(client_id, recommendation_id, "better");
    let t0 = now();

    h.deliver(&event(
        "evt_1",
        "customer.subscription.updated",
        t0,
        subscription("sub_1", "active", metadata.clone()),
    ))
    .await
    .unwrap();
    let first = h.recommendation(recommendation_id).await.purchased_at;

    // Period renewal: a later, distinct event for the same active subscription
    h.deliver(&event(
        "evt_2",
        "customer.subscription.updated",
        t0 + 30,
        subscription("sub_1", "active", metadata),
    ))
    .await
    .unwrap();

    let recommendation = h.recommendation(recommendation_id).await;
    assert_eq!(recommendation.purchased_at, first);
    assert_eq!(h.store.recommendation_history(recommendation_id).len(), 1);

    let purchases = h
        .store
        .activities(client_id)
        .into_iter()
        .filter(|a| a.activity_type == "purchase_completed")
        .count();
    assert_eq!(purchases, 1);
}

#[tokio::test]
async fn test_update_before_create_keeps_latest_state() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);
    let metadata = checkout_metadata(client_id, recommendation_id, "best");
    let t0 = now();

    h.deliver(&event(
        "evt_updated",
        "customer.subscription.updated",
        t0 + 10,
        subscription("sub_1", "active", metadata.clone()),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_created",
        "customer.subscription.created",
        t0,
        subscription("sub_1", "incomplete", metadata),
    ))
    .await
    .unwrap();

    let rows = h.store.subscriptions();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubscriptionStatus::Active);
    assert_eq!(rows[0].client_id, client_id);
    assert_eq!(rows[0].recommendation_id, Some(recommendation_id));
}

#[tokio::test]
async fn test_same_second_events_do_not_regress_status() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);
    let metadata = checkout_metadata(client_id, recommendation_id, "good");
    let t0 = now();

    h.deliver(&event(
        "evt_updated",
        "customer.subscription.updated",
        t0,
        subscription("sub_1", "active", metadata.clone()),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_created",
        "customer.subscription.created",
        t0,
        subscription("sub_1", "incomplete", metadata),
    ))
    .await
    .unwrap();

    assert_eq!(h.store.subscriptions()[0].status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_create_then_update_in_order() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);
    let metadata = checkout_metadata(client_id, recommendation_id, "good");
    let t0 = now();

    h.deliver(&event(
        "evt_created",
        "customer.subscription.created",
        t0,
        subscription("sub_1", "incomplete", metadata.clone()),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_updated",
        "customer.subscription.updated",
        t0 + 2,
        subscription("sub_1", "past_due", metadata),
    ))
    .await
    .unwrap();

    let rows = h.store.subscriptions();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubscriptionStatus::PastDue);
}

#[tokio::test]
async fn test_cancellation_is_terminal() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);
    let metadata = checkout_metadata(client_id, recommendation_id, "better");
    let t0 = now();

    h.deliver(&event(
        "evt_created",
        "customer.subscription.created",
        t0,
        subscription("sub_1", "active", metadata.clone()),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_deleted",
        "customer.subscription.deleted",
        t0 + 10,
        subscription("sub_1", "canceled", metadata.clone()),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_late_update",
        "customer.subscription.updated",
        t0 + 20,
        subscription("sub_1", "active", metadata),
    ))
    .await
    .unwrap();

    let row = &h.store.subscriptions()[0];
    assert_eq!(row.status, SubscriptionStatus::Canceled);
    assert!(row.canceled_at.is_some());

    let canceled = h
        .store
        .activities(client_id)
        .into_iter()
        .filter(|a| a.activity_type == "subscription_canceled")
        .count();
    assert_eq!(canceled, 1);
}

#[tokio::test]
async fn test_discounted_purchase_description() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);
    h.processor
        .add_invoice(invoice_summary("in_sub_1", 40_000, 50_000, Some(20.0)));

    h.deliver(&event(
        "evt_active",
        "customer.subscription.updated",
        now(),
        subscription("sub_1", "active", checkout_metadata(client_id, recommendation_id, "better")),
    ))
    .await
    .unwrap();

    let activity = h.store.activities(client_id);
    assert_eq!(
        activity[0].description,
        "Purchased Better plan for $400.00/month (20% off $500.00)"
    );
    assert_eq!(
        h.store.recommendation_history(recommendation_id)[0].1.as_deref(),
        Some("Purchased Better plan for $400.00/month (20% off $500.00)")
    );
}

#[tokio::test]
async fn test_invoice_lookup_failure_falls_back_to_items() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);

    let outcome = h
        .deliver(&event(
            "evt_active",
            "customer.subscription.updated",
            now(),
            subscription("sub_1", "active", checkout_metadata(client_id, recommendation_id, "better")),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed);

    assert_eq!(
        h.recommendation(recommendation_id).await.status,
        RecommendationStatus::Accepted
    );
    assert_eq!(
        h.store.activities(client_id)[0].description,
        "Purchased Better plan for $500.00/month"
    );
}

#[tokio::test]
async fn test_active_subscription_without_tier_is_not_finalized() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);

    h.deliver(&event(
        "evt_active",
        "customer.subscription.updated",
        now(),
        subscription(
            "sub_1",
            "active",
            json!({
                "clientId": client_id.to_string(),
                "recommendationId": recommendation_id.to_string()
            }),
        ),
    ))
    .await
    .unwrap();

    assert_eq!(
        h.recommendation(recommendation_id).await.status,
        RecommendationStatus::Sent
    );
    assert_eq!(h.store.subscriptions()[0].status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_revenue_redelivery_does_not_multiply() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);
    let t0 = now();

    h.deliver(&event(
        "evt_created",
        "customer.subscription.created",
        t0,
        subscription("sub_1", "active", checkout_metadata(client_id, recommendation_id, "better")),
    ))
    .await
    .unwrap();

    let invoice = paid_invoice("in_1", "sub_1", 50_000, "subscription_create", t0);
    // Same invoice under two event ids, as when an event is resent manually
    h.deliver(&event("evt_paid_1", "invoice.payment_succeeded", t0, invoice.clone()))
        .await
        .unwrap();
    h.deliver(&event("evt_paid_2", "invoice.payment_succeeded", t0, invoice))
        .await
        .unwrap();

    let revenue = h.store.revenue_records();
    assert_eq!(revenue.len(), 1);
    assert_eq!(revenue[0].mrr_cents, 50_000);
    assert_eq!(revenue[0].client_id, client_id);
}

#[tokio::test]
async fn test_renewal_records_change_from_previous_month() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);
    // 2026-01-15 and 2026-02-15 UTC
    let january = 1_768_435_200;
    let february = 1_771_113_600;

    h.deliver(&event(
        "evt_created",
        "customer.subscription.created",
        january,
        subscription("sub_1", "active", checkout_metadata(client_id, recommendation_id, "better")),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_jan",
        "invoice.payment_succeeded",
        january,
        paid_invoice("in_jan", "sub_1", 50_000, "subscription_create", january),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_feb",
        "invoice.payment_succeeded",
        february,
        paid_invoice("in_feb", "sub_1", 65_000, "subscription_cycle", february),
    ))
    .await
    .unwrap();

    let mut revenue = h.store.revenue_records();
    revenue.sort_by_key(|r| r.month);
    assert_eq!(revenue.len(), 2);
    assert_eq!(revenue[1].change_type, RevenueChangeType::Recurring);
    assert_eq!(revenue[1].mrr_cents, 65_000);
    assert_eq!(revenue[1].change_amount_cents, 15_000);
}

#[tokio::test]
async fn test_invoice_for_untracked_subscription_is_skipped() {
    let h = Harness::new();
    let outcome = h
        .deliver(&event(
            "evt_paid",
            "invoice.payment_succeeded",
            now(),
            paid_invoice("in_1", "sub_unknown", 50_000, "subscription_create", now()),
        ))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed);
    assert!(h.store.revenue_records().is_empty());
}

#[tokio::test]
async fn test_invoice_payment_failure_is_recorded() {
    let h = Harness::new();
    let client_id = h.seed_client(None);
    let recommendation_id = h.seed_recommendation(client_id);
    let t0 = now();

    h.deliver(&event(
        "evt_created",
        "customer.subscription.created",
        t0,
        subscription("sub_1", "active", checkout_metadata(client_id, recommendation_id, "better")),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_failed",
        "invoice.payment_failed",
        t0 + 1,
        json!({ "id": "in_2", "subscription": "sub_1", "total": 50_000, "amount_paid": 0 }),
    ))
    .await
    .unwrap();

    let row = &h.store.subscriptions()[0];
    let history = h.store.subscription_history(row.id);
    assert_eq!(history.last().map(|(action, _)| action.as_str()), Some("payment_failed"));

    let activity = h.store.activities(client_id);
    assert_eq!(activity.last().unwrap().activity_type, "invoice_payment_failed");
    assert_eq!(activity.last().unwrap().description, "Invoice payment of $500.00 failed");
}

#[tokio::test]
async fn test_one_time_payment_finalizes_purchase() {
    let h = Harness::new();
    let client_id = h.seed_client(Some("cus_onetime"));
    let recommendation_id = h.seed_recommendation(client_id);

    let mut metadata = checkout_metadata(client_id, recommendation_id, "good");
    metadata["checkoutType"] = json!("onetime");

    h.deliver(&event(
        "evt_pi",
        "payment_intent.succeeded",
        now(),
        json!({
            "id": "pi_1",
            "amount": 15_000,
            "amount_received": 15_000,
            "customer": "cus_onetime",
            "invoice": null,
            "metadata": metadata
        }),
    ))
    .await
    .unwrap();

    let recommendation = h.recommendation(recommendation_id).await;
    assert_eq!(recommendation.status, RecommendationStatus::Accepted);
    assert_eq!(recommendation.purchased_tier, Some(Tier::Good));

    let types: Vec<String> = h
        .store
        .activities(client_id)
        .into_iter()
        .map(|a| a.activity_type)
        .collect();
    assert_eq!(types, vec!["purchase_completed", "payment_succeeded"]);
    assert_eq!(
        h.store.activities(client_id)[0].description,
        "Purchased Good plan for $150.00"
    );
}

#[tokio::test]
async fn test_invoice_payment_intent_is_left_to_invoice_events() {
    let h = Harness::new();
    let client_id = h.seed_client(Some("cus_sub"));
    let recommendation_id = h.seed_recommendation(client_id);

    let mut metadata = checkout_metadata(client_id, recommendation_id, "good");
    metadata["checkoutType"] = json!("onetime");

    h.deliver(&event(
        "evt_pi",
        "payment_intent.succeeded",
        now(),
        json!({ "id": "pi_1", "amount": 15_000, "invoice": "in_1", "metadata": metadata }),
    ))
    .await
    .unwrap();

    assert_eq!(
        h.recommendation(recommendation_id).await.status,
        RecommendationStatus::Sent
    );
    assert!(h.store.activities(client_id).is_empty());
}
