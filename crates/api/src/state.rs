//! Application state

use std::sync::Arc;

use recall_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        // This server exists to reconcile billing state; an unconfigured
        // provider is a startup failure, not a degraded mode.
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Billing reconciliation service initialized");

        Ok(Self {
            pool,
            config,
            billing: Arc::new(billing),
        })
    }
}
