// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Recall Billing Module
//!
//! Subscription state reconciliation against the billing provider. The
//! provider is the source of truth for billing facts; the local record per
//! account is what the rest of the application reads for feature gating.
//! Updates arrive as at-least-once, possibly out-of-order webhook events
//! and as on-demand pulls; a periodic sweep expires lapsed cancellations.
//!
//! ## Features
//!
//! - **Webhook Ingestion**: Signature verification, idempotent dedup,
//!   temporal ordering, absorbing deletion
//! - **Pull Reconciliation**: On-demand read of provider truth with a
//!   forced reconciling write
//! - **User Actions**: Checkout, portal, cancel/resume at period end,
//!   plan changes
//! - **Periodic Sweep**: Expires subscriptions whose scheduled
//!   cancellation has lapsed
//! - **Plan Resolution**: Price table lookup with metadata hints and a
//!   flagged heuristic fallback

pub mod client;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ledger;
pub mod period;
pub mod plan;
pub mod state_machine;
pub mod store;
pub mod verify;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{CheckoutSession, PortalSession, ProviderClient, StripeClient, StripeConfig};

// Coordinator
pub use coordinator::{ReconciliationCoordinator, SweepSummary, WebhookAck};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, ExternalEvent, InvoicePayload, SubscriptionPayload};

// Ledger
pub use ledger::{AppliedEventRecord, IdempotencyLedger, InMemoryEventLedger, MarkOutcome, PgEventLedger};

// Period
pub use period::PeriodEnd;

// Plan
pub use plan::{PlanSource, PlanTier, ResolvedPlan};

// State machine
pub use state_machine::{
    AccountSubscription, Anomaly, BillingDisplay, Outcome, ResolvedSubscription,
    SubscriptionStatus, Transition, TransitionRequest,
};

// Store
pub use store::{InMemorySubscriptionStore, PgSubscriptionStore, SubscriptionStore};

// Verify
pub use verify::EventVerifier;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service: the coordinator plus its configuration
pub struct BillingService {
    pub coordinator: Arc<ReconciliationCoordinator>,
    pub config: StripeConfig,
}

impl BillingService {
    /// Create a new billing service from environment variables,
    /// backed by Postgres and the real provider API
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let client = StripeClient::from_env()?;
        let config = client.config().clone();
        Ok(Self::new(Arc::new(client), config, pool))
    }

    /// Create a new billing service with an explicit provider client,
    /// for tests and alternative deployments
    pub fn new(provider: Arc<dyn ProviderClient>, config: StripeConfig, pool: PgPool) -> Self {
        let ledger = Arc::new(PgEventLedger::new(pool.clone()));
        let store = Arc::new(PgSubscriptionStore::new(pool));
        let coordinator = Arc::new(ReconciliationCoordinator::new(
            provider,
            ledger,
            store,
            config.clone(),
        ));
        Self {
            coordinator,
            config,
        }
    }
}
