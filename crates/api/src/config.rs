//! Application configuration

use std::env;

use tierline_billing::{StripeConfig, DEFAULT_WEBHOOK_TOLERANCE_SECS};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Stripe
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_webhook_tolerance_secs: i64,

    // Feature flags
    pub enable_billing: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let enable_billing = env::var("ENABLE_BILLING")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let stripe_secret_key = non_empty_var("STRIPE_SECRET_KEY");
        if enable_billing && stripe_secret_key.is_none() {
            return Err(ConfigError::Missing("STRIPE_SECRET_KEY"));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),

            // Stripe
            stripe_secret_key,
            // Optional: webhooks answer 500 until it is set
            stripe_webhook_secret: non_empty_var("STRIPE_WEBHOOK_SECRET"),
            stripe_webhook_tolerance_secs: env::var("STRIPE_WEBHOOK_TOLERANCE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs: &i64| *secs > 0)
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS),

            enable_billing,
        })
    }

    /// Stripe settings for the billing service
    pub fn stripe_config(&self) -> Result<StripeConfig, ConfigError> {
        Ok(StripeConfig {
            secret_key: self
                .stripe_secret_key
                .clone()
                .ok_or(ConfigError::Missing("STRIPE_SECRET_KEY"))?,
            webhook_secret: self.stripe_webhook_secret.clone(),
            webhook_tolerance_secs: self.stripe_webhook_tolerance_secs,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}
