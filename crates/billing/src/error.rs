//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Bad caller input; nothing was written
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing webhook signature header")]
    MissingSignature,

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A call to the payment processor failed at `step`
    #[error("Payment processor error during {step}: {message}")]
    PaymentProcessor { step: &'static str, message: String },

    /// Local store failure; after a successful processor call the two may disagree
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn processor(step: &'static str, err: impl std::fmt::Display) -> Self {
        BillingError::PaymentProcessor {
            step,
            message: err.to_string(),
        }
    }

    /// Failures the processor should redeliver the event for
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::PaymentProcessor { .. }
                | BillingError::Database(_)
                | BillingError::Internal(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::processor("stripe_api", err)
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::MalformedPayload(err.to_string())
    }
}

impl From<tierline_shared::SharedError> for BillingError {
    fn from(err: tierline_shared::SharedError) -> Self {
        BillingError::MalformedPayload(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
