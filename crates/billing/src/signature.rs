//! Webhook signature verification
//!
//! Stripe signs `"{timestamp}.{raw body}"` with HMAC-SHA256 keyed by the
//! endpoint secret and sends `t=<timestamp>,v1=<hex>[,v1=<hex>...]`. The check
//! runs over the exact bytes received, before any JSON parsing.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Verifies inbound webhook signatures against the configured secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>, tolerance_secs: i64) -> Self {
        Self {
            secret,
            tolerance_secs,
        }
    }

    /// Verify `payload` against the signature header at the current time
    pub fn verify(&self, payload: &[u8], header: Option<&str>) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify `payload` against the signature header as of `now` (unix seconds)
    pub fn verify_at(&self, payload: &[u8], header: Option<&str>, now: i64) -> BillingResult<()> {
        let header = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(BillingError::MissingSignature)?;

        let secret = self.secret.as_deref().ok_or_else(|| {
            tracing::error!("Webhook secret is not configured; rejecting webhook");
            BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string())
        })?;

        let parsed = SignatureHeader::parse(header).ok_or_else(|| {
            tracing::warn!("Malformed webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if (now - parsed.timestamp).abs() > self.tolerance_secs {
            tracing::warn!(
                timestamp = parsed.timestamp,
                now = now,
                tolerance_secs = self.tolerance_secs,
                "Webhook signature timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let matched = parsed.signatures.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(parsed.timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(payload);
            mac.verify_slice(&expected).is_ok()
        });

        if !matched {
            tracing::warn!(
                payload_len = payload.len(),
                candidates = parsed.signatures.len(),
                "Webhook signature verification failed"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

impl SignatureHeader {
    fn parse(header: &str) -> Option<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => signatures.push(value.to_string()),
                _ => {}
            }
        }

        if signatures.is_empty() {
            return None;
        }
        Some(Self {
            timestamp: timestamp?,
            signatures,
        })
    }
}

/// Build a signature header for `payload`, as the processor would.
///
/// Used by tests and local tooling that replay events.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Internal(format!("Invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}
