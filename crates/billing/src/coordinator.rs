//! Reconciliation Coordinator
//!
//! Orchestrates the full pipeline for webhook-driven updates
//! (verify -> dedupe -> resolve -> transition -> persist -> mark applied)
//! plus the pull-based path that reads current truth from the provider and
//! forces a reconciling write. User actions and the periodic sweep enter
//! the same state machine with synthesized transition requests.
//!
//! ## Acknowledgement policy
//!
//! Trust failures (bad signature, malformed payload) are returned to the
//! transport so it responds non-2xx and the provider retries or alerts.
//! Any failure after verification is logged and acknowledged anyway:
//! repeated redelivery of an event that cannot be processed is strictly
//! worse than losing one update that the next event, the pull path, or the
//! sweep will correct.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::client::{CheckoutSession, PortalSession, ProviderClient, StripeConfig};
use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, ExternalEvent};
use crate::ledger::IdempotencyLedger;
use crate::plan::PlanTier;
use crate::state_machine::{
    self, AccountSubscription, Outcome, ResolvedSubscription, Transition, TransitionRequest,
};
use crate::store::SubscriptionStore;
use crate::verify::EventVerifier;

/// Bounded retries for an optimistic write that lost its race
const MAX_CAS_RETRIES: usize = 3;

/// Response to the webhook transport. Everything except a trust error maps
/// to a 2xx acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    /// Event applied (or correctly discarded as stale)
    Processed,
    /// Idempotent short-circuit: the ledger already had this event id
    AlreadyApplied,
    /// Event type we do not handle, or an event we cannot attribute
    Ignored,
    /// Processing failed after verification; acknowledged to stop
    /// provider redelivery, recorded internally for operators
    FailedAcknowledged,
}

/// Result of one sweep run
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweepSummary {
    /// True when another sweep was already running and this one bailed
    pub skipped: bool,
    pub examined: usize,
    pub expired: usize,
    pub errors: usize,
}

pub struct ReconciliationCoordinator {
    provider: Arc<dyn ProviderClient>,
    ledger: Arc<dyn IdempotencyLedger>,
    store: Arc<dyn SubscriptionStore>,
    verifier: EventVerifier,
    config: StripeConfig,
    price_table: HashMap<String, PlanTier>,
    /// Held for the duration of a sweep so sweeps never overlap
    sweep_lock: tokio::sync::Mutex<()>,
}

impl ReconciliationCoordinator {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        ledger: Arc<dyn IdempotencyLedger>,
        store: Arc<dyn SubscriptionStore>,
        config: StripeConfig,
    ) -> Self {
        let verifier = EventVerifier::new(config.webhook_secret.clone());
        let price_table = config.price_table();
        Self {
            provider,
            ledger,
            store,
            verifier,
            config,
            price_table,
            sweep_lock: tokio::sync::Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Webhook path
    // ------------------------------------------------------------------

    /// Process one raw webhook delivery.
    ///
    /// Errors are trust errors only; the transport should respond non-2xx
    /// for those so the provider does not mark the event delivered.
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> BillingResult<WebhookAck> {
        let event = self.verifier.verify(raw_body, signature_header)?;

        if !event.verified {
            tracing::warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Processing UNVERIFIED webhook event"
            );
        }

        match self.process_event(&event).await {
            Ok(ack) => Ok(ack),
            Err(e) => {
                // Deliberate: acknowledged to the provider, loud internally.
                // The pull path and the sweep self-heal missed updates.
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed after verification; acknowledging anyway"
                );
                Ok(WebhookAck::FailedAcknowledged)
            }
        }
    }

    async fn process_event(&self, event: &ExternalEvent) -> BillingResult<WebhookAck> {
        if self.ledger.has_been_applied(&event.event_id).await? {
            tracing::info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Duplicate webhook event, idempotent short-circuit"
            );
            return Ok(WebhookAck::AlreadyApplied);
        }

        let (account_id, transition) = match event.kind {
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                let payload = event.subscription()?;
                let account_id = self
                    .resolve_account(payload.account_hint(), &payload.id)
                    .await?;
                let resolved = ResolvedSubscription::from_payload(
                    &payload,
                    &self.price_table,
                    None,
                    OffsetDateTime::now_utc(),
                );
                let transition = if event.kind == EventKind::SubscriptionCreated {
                    Transition::SubscriptionCreated(resolved)
                } else {
                    Transition::SubscriptionUpdated(resolved)
                };
                (account_id, transition)
            }

            EventKind::SubscriptionDeleted => {
                let payload = event.subscription()?;
                let account_id = self
                    .resolve_account(payload.account_hint(), &payload.id)
                    .await?;
                (
                    account_id,
                    Transition::SubscriptionDeleted {
                        subscription_id: payload.id,
                    },
                )
            }

            EventKind::InvoicePaymentSucceeded | EventKind::InvoicePaymentFailed => {
                let invoice = event.invoice()?;
                let Some(subscription_id) = invoice.subscription.clone() else {
                    tracing::info!(
                        event_id = %event.event_id,
                        invoice_id = %invoice.id,
                        "Invoice event without subscription reference, ignoring"
                    );
                    return Ok(WebhookAck::Ignored);
                };
                let Some(record) = self.store.find_by_subscription(&subscription_id).await?
                else {
                    tracing::warn!(
                        event_id = %event.event_id,
                        subscription_id = %subscription_id,
                        "Invoice event for subscription not on file, ignoring"
                    );
                    return Ok(WebhookAck::Ignored);
                };
                let transition = if event.kind == EventKind::InvoicePaymentSucceeded {
                    Transition::InvoicePaymentSucceeded {
                        subscription_id: Some(subscription_id),
                        period_end: invoice
                            .effective_period_end()
                            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
                    }
                } else {
                    Transition::InvoicePaymentFailed {
                        subscription_id: Some(subscription_id),
                    }
                };
                (record.account_id, transition)
            }

            EventKind::CheckoutCompleted => {
                return self.process_checkout_completed(event).await;
            }

            EventKind::Unhandled => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    "Received unhandled provider event type - no handler configured"
                );
                return Ok(WebhookAck::Ignored);
            }
        };

        self.apply_with_retry(
            account_id,
            TransitionRequest {
                transition,
                event_id: Some(event.event_id.clone()),
                occurred_at: event.occurred_at,
            },
        )
        .await?;

        self.mark_applied(event, account_id).await;
        Ok(WebhookAck::Processed)
    }

    /// Checkout completion bootstraps the provider subscription id and then
    /// pulls the subscription object to run the created transition.
    /// Checkout completion and subscription creation race; either may
    /// arrive first, and both paths converge on the same state.
    async fn process_checkout_completed(
        &self,
        event: &ExternalEvent,
    ) -> BillingResult<WebhookAck> {
        let session = event.checkout_session()?;
        let metadata = session.metadata.clone().unwrap_or_default();

        let Some(account_id) = metadata
            .get("account_id")
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            tracing::warn!(
                event_id = %event.event_id,
                session_id = %session.id,
                "Checkout session without account_id metadata, ignoring"
            );
            return Ok(WebhookAck::Ignored);
        };

        let Some(subscription_id) = session.subscription.clone() else {
            tracing::info!(
                event_id = %event.event_id,
                session_id = %session.id,
                "Checkout session without subscription (one-time payment?), ignoring"
            );
            return Ok(WebhookAck::Ignored);
        };

        let payload = self.retrieve_with_backoff(&subscription_id).await?;

        let mut resolved = ResolvedSubscription::from_payload(
            &payload,
            &self.price_table,
            metadata.get("plan").map(|s| s.as_str()),
            OffsetDateTime::now_utc(),
        );
        if resolved.customer_id.is_none() {
            resolved.customer_id = session.customer.clone();
        }

        self.apply_with_retry(
            account_id,
            TransitionRequest {
                transition: Transition::SubscriptionCreated(resolved),
                event_id: Some(event.event_id.clone()),
                occurred_at: event.occurred_at,
            },
        )
        .await?;

        self.mark_applied(event, account_id).await;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %subscription_id,
            "Checkout completed, subscription reconciled"
        );
        Ok(WebhookAck::Processed)
    }

    // ------------------------------------------------------------------
    // Pull path
    // ------------------------------------------------------------------

    /// Read current truth from the provider and force a reconciling write.
    ///
    /// Used when a user opens subscription settings (webhook delivery lag
    /// cannot be trusted blindly) and by recovery tooling.
    pub async fn pull(&self, account_id: Uuid) -> BillingResult<AccountSubscription> {
        let record = self.store.get(account_id).await?;
        let Some(subscription_id) = record.provider_subscription_id.clone() else {
            // Nothing on file with the provider; local record is the truth
            return Ok(record);
        };

        let payload = self.retrieve_with_backoff(&subscription_id).await?;
        let now = OffsetDateTime::now_utc();

        let transition = if matches!(payload.status.as_str(), "canceled" | "incomplete_expired")
        {
            Transition::SubscriptionDeleted {
                subscription_id: payload.id.clone(),
            }
        } else {
            Transition::SubscriptionUpdated(ResolvedSubscription::from_payload(
                &payload,
                &self.price_table,
                None,
                now,
            ))
        };

        let applied = self
            .apply_with_retry(
                account_id,
                TransitionRequest {
                    transition,
                    event_id: None,
                    occurred_at: now,
                },
            )
            .await?;

        match applied {
            Some(record) => Ok(record),
            None => self.store.get(account_id).await,
        }
    }

    // ------------------------------------------------------------------
    // Periodic sweep
    // ------------------------------------------------------------------

    /// Expire every record whose scheduled cancellation has lapsed.
    ///
    /// At most one sweep runs at a time; each account goes through the
    /// normal CAS transition path so the sweep composes with concurrently
    /// arriving webhooks.
    pub async fn run_sweep(&self) -> BillingResult<SweepSummary> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            tracing::warn!("Sweep already running, skipping this invocation");
            return Ok(SweepSummary {
                skipped: true,
                ..SweepSummary::default()
            });
        };

        let now = OffsetDateTime::now_utc();
        let accounts = self.store.list_expired(now).await?;
        let mut summary = SweepSummary {
            examined: accounts.len(),
            ..SweepSummary::default()
        };

        for account_id in accounts {
            let request = TransitionRequest {
                transition: Transition::SweepExpire,
                event_id: None,
                occurred_at: now,
            };
            match self.apply_with_retry(account_id, request).await {
                Ok(Some(_)) => {
                    summary.expired += 1;
                    tracing::info!(account_id = %account_id, "Sweep expired lapsed subscription");
                }
                Ok(None) => {
                    // A concurrent webhook already moved the record on
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        account_id = %account_id,
                        error = %e,
                        "Sweep failed to expire account"
                    );
                }
            }
        }

        tracing::info!(
            examined = summary.examined,
            expired = summary.expired,
            errors = summary.errors,
            "Sweep complete"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // User-initiated actions (synchronous, bounded by the client timeout)
    // ------------------------------------------------------------------

    /// Schedule cancellation at period end. The provider is updated first;
    /// on timeout the local record is left untouched and the caller is
    /// told the action did not complete.
    pub async fn cancel(&self, account_id: Uuid) -> BillingResult<AccountSubscription> {
        let record = self.store.get(account_id).await?;
        let subscription_id = record
            .provider_subscription_id
            .clone()
            .ok_or(BillingError::NoSubscription)?;

        self.provider
            .set_cancel_at_period_end(&subscription_id, true)
            .await?;

        let applied = self
            .apply_with_retry(
                account_id,
                TransitionRequest {
                    transition: Transition::CancelAtPeriodEnd,
                    event_id: None,
                    occurred_at: OffsetDateTime::now_utc(),
                },
            )
            .await?;

        tracing::info!(account_id = %account_id, "Cancellation scheduled at period end");
        match applied {
            Some(record) => Ok(record),
            None => self.store.get(account_id).await,
        }
    }

    /// Undo a scheduled cancellation. Only legal while the cancellation is
    /// still pending.
    pub async fn resume(&self, account_id: Uuid) -> BillingResult<AccountSubscription> {
        let record = self.store.get(account_id).await?;
        if !record.cancel_at_period_end {
            // Domain error before any provider call
            return Err(BillingError::InvalidTransition(
                "no pending cancellation to resume".into(),
            ));
        }
        let subscription_id = record
            .provider_subscription_id
            .clone()
            .ok_or(BillingError::NoSubscription)?;

        self.provider
            .set_cancel_at_period_end(&subscription_id, false)
            .await?;

        let applied = self
            .apply_with_retry(
                account_id,
                TransitionRequest {
                    transition: Transition::ResumeCancelled,
                    event_id: None,
                    occurred_at: OffsetDateTime::now_utc(),
                },
            )
            .await?;

        tracing::info!(account_id = %account_id, "Scheduled cancellation resumed");
        match applied {
            Some(record) => Ok(record),
            None => self.store.get(account_id).await,
        }
    }

    /// Move an existing subscription to a different paid tier. Tier changes
    /// without a subscription on file go through checkout instead.
    pub async fn change_plan(
        &self,
        account_id: Uuid,
        tier: PlanTier,
    ) -> BillingResult<AccountSubscription> {
        if !tier.is_paid() {
            return Err(BillingError::InvalidTransition(
                "downgrade to free is a cancellation".into(),
            ));
        }
        let price_id = self
            .config
            .price_id_for_tier(tier)
            .ok_or_else(|| BillingError::NotConfigured(format!("price id for {}", tier)))?
            .to_string();

        let record = self.store.get(account_id).await?;
        let subscription_id = record
            .provider_subscription_id
            .clone()
            .ok_or(BillingError::NoSubscription)?;

        let payload = self
            .provider
            .change_price(&subscription_id, &price_id, tier.as_str())
            .await?;

        let now = OffsetDateTime::now_utc();
        let resolved = ResolvedSubscription::from_payload(
            &payload,
            &self.price_table,
            Some(tier.as_str()),
            now,
        );

        let applied = self
            .apply_with_retry(
                account_id,
                TransitionRequest {
                    transition: Transition::SubscriptionUpdated(resolved),
                    event_id: None,
                    occurred_at: now,
                },
            )
            .await?;

        tracing::info!(account_id = %account_id, tier = %tier, "Plan changed");
        match applied {
            Some(record) => Ok(record),
            None => self.store.get(account_id).await,
        }
    }

    /// Create a checkout session for a paid tier
    pub async fn checkout(
        &self,
        account_id: Uuid,
        tier: PlanTier,
    ) -> BillingResult<CheckoutSession> {
        if !tier.is_paid() {
            return Err(BillingError::InvalidTransition(
                "checkout requires a paid tier".into(),
            ));
        }
        let price_id = self
            .config
            .price_id_for_tier(tier)
            .ok_or_else(|| BillingError::NotConfigured(format!("price id for {}", tier)))?
            .to_string();

        let record = self.store.get(account_id).await?;
        let mut metadata = HashMap::new();
        metadata.insert("account_id".to_string(), account_id.to_string());
        metadata.insert("plan".to_string(), tier.as_str().to_string());

        self.provider
            .create_checkout_session(record.provider_customer_id.as_deref(), &price_id, &metadata)
            .await
    }

    /// Create a billing portal session
    pub async fn portal(&self, account_id: Uuid) -> BillingResult<PortalSession> {
        let record = self.store.get(account_id).await?;
        let customer_id = record
            .provider_customer_id
            .ok_or(BillingError::NoSubscription)?;
        self.provider.create_portal_session(&customer_id).await
    }

    /// Current record without a provider round-trip
    pub async fn current(&self, account_id: Uuid) -> BillingResult<AccountSubscription> {
        self.store.get(account_id).await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn resolve_account(
        &self,
        account_hint: Option<&str>,
        subscription_id: &str,
    ) -> BillingResult<Uuid> {
        if let Some(id) = account_hint.and_then(|s| Uuid::parse_str(s).ok()) {
            return Ok(id);
        }
        if let Some(record) = self.store.find_by_subscription(subscription_id).await? {
            return Ok(record.account_id);
        }
        Err(BillingError::UnknownAccount(subscription_id.to_string()))
    }

    /// Read-compute-write as one logical unit per account: optimistic CAS
    /// with bounded retries. Returns the stored record, or None when the
    /// transition was stale or a no-op.
    async fn apply_with_retry(
        &self,
        account_id: Uuid,
        request: TransitionRequest,
    ) -> BillingResult<Option<AccountSubscription>> {
        for attempt in 0..=MAX_CAS_RETRIES {
            let current = self.store.get(account_id).await?;

            match state_machine::apply(&current, &request)? {
                Outcome::Applied { record, anomalies } => {
                    for anomaly in &anomalies {
                        tracing::warn!(
                            account_id = %account_id,
                            anomaly = %anomaly,
                            "Reconciliation anomaly"
                        );
                    }
                    match self.store.put(&record, current.version).await {
                        Ok(stored) => return Ok(Some(stored)),
                        Err(BillingError::WriteConflict(_)) if attempt < MAX_CAS_RETRIES => {
                            tracing::debug!(
                                account_id = %account_id,
                                attempt = attempt + 1,
                                "Optimistic write lost the race, retrying"
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Outcome::Stale => return Ok(None),
                Outcome::NoOp { anomalies } => {
                    for anomaly in &anomalies {
                        tracing::warn!(
                            account_id = %account_id,
                            anomaly = %anomaly,
                            "Reconciliation anomaly (no-op)"
                        );
                    }
                    return Ok(None);
                }
            }
        }
        Err(BillingError::WriteConflict(account_id))
    }

    async fn retrieve_with_backoff(
        &self,
        subscription_id: &str,
    ) -> BillingResult<crate::events::SubscriptionPayload> {
        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        RetryIf::spawn(
            strategy,
            || self.provider.retrieve_subscription(subscription_id),
            |e: &BillingError| e.is_transient(),
        )
        .await
    }

    /// Final step of successful processing. Losing the insert race means
    /// another delivery finished first; that is a success.
    async fn mark_applied(&self, event: &ExternalEvent, account_id: Uuid) {
        match self
            .ledger
            .mark_applied(&event.event_id, account_id, &event.event_type)
            .await
        {
            Ok(crate::ledger::MarkOutcome::Recorded) => {}
            Ok(crate::ledger::MarkOutcome::AlreadyApplied) => {
                tracing::info!(
                    event_id = %event.event_id,
                    "Concurrent delivery recorded this event first"
                );
            }
            Err(e) => {
                // The event was applied; a missing ledger entry only costs
                // one redundant (and stale-guarded) reapplication later.
                tracing::error!(
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to record applied event in ledger"
                );
            }
        }
    }
}
