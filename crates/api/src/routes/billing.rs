//! Checkout and Stripe webhook routes

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use tierline_billing::{CheckoutRequest, CheckoutResponse, OneTimeCheckoutResponse};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Start a subscription checkout for the selected recommendation tier
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    tracing::info!(
        client_id = %request.client_id,
        recommendation_id = ?request.recommendation_id,
        items = request.items.len(),
        "Checkout requested"
    );

    let response = billing
        .checkout
        .create_subscription_checkout(request)
        .await
        .map_err(ApiError::from_checkout)?;

    Ok(Json(response))
}

/// Start a checkout for a cart of one-time items only
pub async fn create_one_time_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<OneTimeCheckoutResponse>> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    tracing::info!(
        client_id = %request.client_id,
        recommendation_id = ?request.recommendation_id,
        items = request.items.len(),
        "One-time checkout requested"
    );

    let response = billing
        .checkout
        .create_one_time_checkout(request)
        .await
        .map_err(ApiError::from_checkout)?;

    Ok(Json(response))
}

/// Handle Stripe webhook events
///
/// The signature is checked over the raw body bytes, so the body must not be
/// parsed before verification.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok());
    if signature.is_none() {
        tracing::warn!("Stripe webhook missing signature header");
    }

    let event = billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook rejected");
            ApiError::from_webhook(e)
        })?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    let outcome = billing
        .webhooks
        .handle_event(&event)
        .await
        .map_err(ApiError::from_webhook)?;

    tracing::info!(event_id = %event.id, outcome = ?outcome, "Stripe webhook processed");

    Ok(Json(json!({ "received": true })))
}
