//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use tierline_billing::BillingService;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Absent when the server runs without a database (tests, local demos)
    pub pool: Option<PgPool>,
    /// Absent when billing is disabled
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(config: Config, pool: Option<PgPool>, billing: Option<BillingService>) -> Self {
        Self {
            config: Arc::new(config),
            pool,
            billing: billing.map(Arc::new),
        }
    }
}
