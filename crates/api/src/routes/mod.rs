//! API routes

pub mod billing;
pub mod health;

use axum::{extract::DefaultBodyLimit, routing::{get, post}, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let mut api_v1_routes = Router::new();

    // Checkout is called by the client UI; the webhook is public and relies on
    // signature verification
    if state.config.enable_billing {
        api_v1_routes = api_v1_routes
            .route("/billing/checkout", post(billing::create_checkout))
            .route("/billing/checkout/one-time", post(billing::create_one_time_checkout))
            .route("/billing/webhook", post(billing::webhook));
    }

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
