//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use tierline_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Billing errors
    #[error("Failed to create subscription")]
    CheckoutFailed,
    #[error("Webhook processing failed")]
    WebhookFailed,

    // Internal errors
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl ApiError {
    /// Map a checkout failure. Processor and store details stay in the logs.
    pub fn from_checkout(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => ApiError::Validation(msg),
            BillingError::NotFound(_) => ApiError::NotFound,
            other => {
                tracing::error!(error = %other, "Checkout failed");
                ApiError::CheckoutFailed
            }
        }
    }

    /// Map a webhook failure. Non-2xx answers make the processor redeliver.
    pub fn from_webhook(err: BillingError) -> Self {
        match err {
            BillingError::MissingSignature => {
                ApiError::BadRequest("Missing Stripe signature".to_string())
            }
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::MalformedPayload(msg) => ApiError::BadRequest(msg),
            BillingError::Config(msg) => ApiError::Configuration(msg),
            _ => ApiError::WebhookFailed,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),

            // Billing
            ApiError::CheckoutFailed => (StatusCode::INTERNAL_SERVER_ERROR, "CHECKOUT_FAILED", self.to_string()),
            ApiError::WebhookFailed => (StatusCode::INTERNAL_SERVER_ERROR, "WEBHOOK_FAILED", self.to_string()),

            // Internal
            ApiError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR", "Server is not configured for this request".to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
