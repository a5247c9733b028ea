//! Subscription State Machine
//!
//! Applies a validated, deduplicated transition to an account's
//! subscription record. The apply function is pure: it reads the current
//! record and produces the next one (or decides the input is stale),
//! leaving persistence and locking to the coordinator. This keeps every
//! transition rule independently testable without a database.
//!
//! ## Ordering
//!
//! Every transition records the source event's provider-assigned timestamp.
//! A provider-sourced transition is applied only if its timestamp is >= the
//! timestamp on file, so late redelivery of an older event can never roll
//! the record backwards. Deletion is absorbing: once a subscription id has
//! been deleted it is remembered as retired, and no event for that id can
//! revive the record regardless of timestamps.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionPayload;
use crate::period::{self, PeriodEnd};
use crate::plan::{self, PlanTier, ResolvedPlan};

/// Subscription lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Inactive,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(SubscriptionStatus::Inactive),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Map the provider's status vocabulary onto ours. Unpaid keeps the
    /// grace-period semantics of past_due; incomplete states grant nothing.
    pub fn from_provider(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" | "unpaid" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "incomplete" | "incomplete_expired" | "paused" => SubscriptionStatus::Inactive,
            other => {
                tracing::warn!(status = %other, "Unknown provider subscription status");
                SubscriptionStatus::Inactive
            }
        }
    }

    pub fn grants_access(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Display-only billing data. Never drives authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingDisplay {
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<String>,
}

/// The persisted subscription record, one per account.
///
/// Created implicitly as free/inactive the first time an account is seen;
/// mutated only through [`apply`]; never deleted, only driven back to
/// free/inactive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSubscription {
    pub account_id: Uuid,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<OffsetDateTime>,
    /// True when `current_period_end` was computed locally rather than
    /// read from the provider
    pub period_end_estimated: bool,
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    /// Subscription id of the most recently deleted subscription. Events
    /// for a retired id can never revive the record.
    pub retired_subscription_id: Option<String>,
    pub trial_end: Option<OffsetDateTime>,
    pub billing: BillingDisplay,
    /// Most recent event that produced this state, for diagnostics
    pub last_applied_event_id: Option<String>,
    /// Provider timestamp of the last applied transition, for ordering
    pub last_event_at: Option<OffsetDateTime>,
    /// Optimistic concurrency version, bumped by the store on every write
    pub version: i64,
}

impl AccountSubscription {
    pub fn new_free(account_id: Uuid) -> Self {
        Self {
            account_id,
            plan: PlanTier::Free,
            status: SubscriptionStatus::Inactive,
            cancel_at_period_end: false,
            current_period_end: None,
            period_end_estimated: false,
            provider_subscription_id: None,
            provider_customer_id: None,
            retired_subscription_id: None,
            trial_end: None,
            billing: BillingDisplay::default(),
            last_applied_event_id: None,
            last_event_at: None,
            version: 0,
        }
    }
}

/// A provider subscription payload after plan and period resolution
#[derive(Debug, Clone)]
pub struct ResolvedSubscription {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub plan: ResolvedPlan,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub period_end: PeriodEnd,
    pub trial_end: Option<OffsetDateTime>,
    pub billing: BillingDisplay,
}

impl ResolvedSubscription {
    /// Run the Plan Resolver and Period Calculator over a raw payload.
    ///
    /// `extra_plan_hint` carries a hint from outside the payload itself
    /// (e.g. checkout session metadata when the subscription object has
    /// none); the payload's own metadata wins when both are present.
    pub fn from_payload(
        payload: &SubscriptionPayload,
        price_table: &std::collections::HashMap<String, PlanTier>,
        extra_plan_hint: Option<&str>,
        now: OffsetDateTime,
    ) -> Self {
        let hint = payload.plan_hint().or(extra_plan_hint);
        let plan = plan::resolve(payload.price_id(), hint, price_table);
        let period_end = period::current_period_end(payload, now);

        let billing = match payload.price() {
            Some(price) => BillingDisplay {
                amount_cents: price.unit_amount,
                currency: price.currency.clone(),
                interval: price
                    .recurring
                    .as_ref()
                    .and_then(|r| r.interval.clone()),
            },
            None => BillingDisplay::default(),
        };

        Self {
            subscription_id: payload.id.clone(),
            customer_id: payload.customer.clone(),
            plan,
            status: SubscriptionStatus::from_provider(&payload.status),
            cancel_at_period_end: payload.cancel_at_period_end,
            cancel_at: payload
                .cancel_at
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            period_end,
            trial_end: payload
                .trial_end
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            billing,
        }
    }
}

/// One supported state transition input
#[derive(Debug, Clone)]
pub enum Transition {
    SubscriptionCreated(ResolvedSubscription),
    SubscriptionUpdated(ResolvedSubscription),
    SubscriptionDeleted { subscription_id: String },
    InvoicePaymentSucceeded {
        subscription_id: Option<String>,
        period_end: Option<OffsetDateTime>,
    },
    InvoicePaymentFailed { subscription_id: Option<String> },
    /// User-initiated: schedule cancellation at period end
    CancelAtPeriodEnd,
    /// User-initiated: undo a scheduled cancellation
    ResumeCancelled,
    /// Periodic sweep: expire a lapsed scheduled cancellation
    SweepExpire,
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::SubscriptionCreated(_) => "subscription_created",
            Transition::SubscriptionUpdated(_) => "subscription_updated",
            Transition::SubscriptionDeleted { .. } => "subscription_deleted",
            Transition::InvoicePaymentSucceeded { .. } => "invoice_payment_succeeded",
            Transition::InvoicePaymentFailed { .. } => "invoice_payment_failed",
            Transition::CancelAtPeriodEnd => "cancel_at_period_end",
            Transition::ResumeCancelled => "resume_cancelled",
            Transition::SweepExpire => "sweep_expire",
        }
    }

    /// Provider-sourced transitions are subject to the timestamp ordering
    /// rule; synthesized ones (user actions, sweep) are not, and deletion
    /// always wins.
    fn ordered(&self) -> bool {
        matches!(
            self,
            Transition::SubscriptionCreated(_)
                | Transition::SubscriptionUpdated(_)
                | Transition::InvoicePaymentSucceeded { .. }
                | Transition::InvoicePaymentFailed { .. }
        )
    }
}

/// A transition plus its provenance
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub transition: Transition,
    /// Provider event id, when webhook-sourced
    pub event_id: Option<String>,
    /// Provider-assigned event time (or the wall clock for synthesized
    /// transitions)
    pub occurred_at: OffsetDateTime,
}

/// Something worth reporting to operators but not worth failing over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Plan resolution fell through to the flagged fallback
    UncertainPlan { price_hint: Option<String> },
    /// Provider claims an access-granting status but resolution produced
    /// the free tier; promoted to the lowest paid tier
    FreePlanWithAccess,
    /// Invoice event that matches no subscription on file
    UnmatchedInvoice { subscription_id: Option<String> },
    /// Deletion for a subscription other than the live one
    MismatchedDeletion { subscription_id: String },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::UncertainPlan { price_hint } => {
                write!(f, "uncertain plan resolution (price: {:?})", price_hint)
            }
            Anomaly::FreePlanWithAccess => {
                write!(f, "free plan resolved for access-granting status")
            }
            Anomaly::UnmatchedInvoice { subscription_id } => {
                write!(f, "invoice for unmatched subscription {:?}", subscription_id)
            }
            Anomaly::MismatchedDeletion { subscription_id } => {
                write!(f, "deletion for non-live subscription {}", subscription_id)
            }
        }
    }
}

/// Result of applying a transition
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The record changed; persist it
    Applied {
        record: AccountSubscription,
        anomalies: Vec<Anomaly>,
    },
    /// Input is older than the state on file (or a duplicate); discard
    Stale,
    /// Legal but nothing to do; no write
    NoOp { anomalies: Vec<Anomaly> },
}

/// Fallback horizon when a cancellation is scheduled with no period end on
/// file: the record must always know when access ends.
const CANCEL_FALLBACK: Duration = Duration::days(30);

/// Apply a transition to the current record.
///
/// Pure: no I/O. Invalid user-initiated transitions return a domain error
/// and imply no write; they are never retried.
pub fn apply(
    current: &AccountSubscription,
    request: &TransitionRequest,
) -> BillingResult<Outcome> {
    // Duplicate delivery that slipped past the ledger (e.g. in-flight race)
    if request.event_id.is_some() && request.event_id == current.last_applied_event_id {
        return Ok(Outcome::Stale);
    }

    if request.transition.ordered() {
        if let Some(on_file) = current.last_event_at {
            if request.occurred_at < on_file {
                tracing::info!(
                    account_id = %current.account_id,
                    transition = request.transition.name(),
                    event_at = %request.occurred_at,
                    on_file = %on_file,
                    "Discarding stale out-of-order event"
                );
                return Ok(Outcome::Stale);
            }
        }
    }

    match &request.transition {
        Transition::SubscriptionCreated(sub) | Transition::SubscriptionUpdated(sub) => {
            Ok(apply_subscription_sync(current, sub, request))
        }

        Transition::SubscriptionDeleted { subscription_id } => {
            if current.retired_subscription_id.as_deref() == Some(subscription_id.as_str()) {
                return Ok(Outcome::Stale);
            }
            match &current.provider_subscription_id {
                Some(live) if live != subscription_id => {
                    // A new billing cycle already replaced this subscription;
                    // deleting the old one must not kill the new one.
                    Ok(Outcome::NoOp {
                        anomalies: vec![Anomaly::MismatchedDeletion {
                            subscription_id: subscription_id.clone(),
                        }],
                    })
                }
                _ => Ok(Outcome::Applied {
                    record: force_free(current, Some(subscription_id.clone()), request),
                    anomalies: vec![],
                }),
            }
        }

        Transition::InvoicePaymentSucceeded { subscription_id, period_end } => {
            if !invoice_matches(current, subscription_id.as_deref()) {
                return Ok(Outcome::NoOp {
                    anomalies: vec![Anomaly::UnmatchedInvoice {
                        subscription_id: subscription_id.clone(),
                    }],
                });
            }
            let mut record = current.clone();
            record.status = SubscriptionStatus::Active;
            if let Some(end) = period_end {
                // Invoice period ends are provider-sourced, so authoritative
                record.current_period_end = Some(*end);
                record.period_end_estimated = false;
            }
            Ok(Outcome::Applied {
                record: stamp(record, request),
                anomalies: vec![],
            })
        }

        Transition::InvoicePaymentFailed { subscription_id } => {
            if !invoice_matches(current, subscription_id.as_deref()) {
                return Ok(Outcome::NoOp {
                    anomalies: vec![Anomaly::UnmatchedInvoice {
                        subscription_id: subscription_id.clone(),
                    }],
                });
            }
            // Grace period: do not revoke access on one failed charge
            let mut record = current.clone();
            record.status = SubscriptionStatus::PastDue;
            Ok(Outcome::Applied {
                record: stamp(record, request),
                anomalies: vec![],
            })
        }

        Transition::CancelAtPeriodEnd => {
            if current.provider_subscription_id.is_none() {
                return Err(BillingError::InvalidTransition(
                    "no subscription to cancel".into(),
                ));
            }
            if current.status == SubscriptionStatus::Canceled
                || current.status == SubscriptionStatus::Inactive
            {
                return Err(BillingError::InvalidTransition(
                    "subscription is not active".into(),
                ));
            }
            if current.cancel_at_period_end {
                return Ok(Outcome::NoOp { anomalies: vec![] });
            }
            let mut record = current.clone();
            record.cancel_at_period_end = true;
            // The record must know when access ends once cancellation is
            // scheduled; the next provider event or pull refreshes this.
            if record.current_period_end.is_none() {
                record.current_period_end = Some(request.occurred_at + CANCEL_FALLBACK);
                record.period_end_estimated = true;
            }
            Ok(Outcome::Applied {
                record: stamp(record, request),
                anomalies: vec![],
            })
        }

        Transition::ResumeCancelled => {
            if !current.cancel_at_period_end {
                return Err(BillingError::InvalidTransition(
                    "no pending cancellation to resume".into(),
                ));
            }
            let mut record = current.clone();
            record.cancel_at_period_end = false;
            Ok(Outcome::Applied {
                record: stamp(record, request),
                anomalies: vec![],
            })
        }

        Transition::SweepExpire => {
            let lapsed = current.cancel_at_period_end
                && current
                    .current_period_end
                    .map(|end| end < request.occurred_at)
                    .unwrap_or(false);
            if !lapsed {
                return Ok(Outcome::NoOp { anomalies: vec![] });
            }
            let retired = current.provider_subscription_id.clone();
            Ok(Outcome::Applied {
                record: force_free(current, retired, request),
                anomalies: vec![],
            })
        }
    }
}

/// Shared field assignment for created/updated transitions
fn apply_subscription_sync(
    current: &AccountSubscription,
    sub: &ResolvedSubscription,
    request: &TransitionRequest,
) -> Outcome {
    // A retired subscription id can never come back (absorbing deletion)
    if current.retired_subscription_id.as_deref() == Some(sub.subscription_id.as_str()) {
        return Outcome::Stale;
    }

    let mut anomalies = Vec::new();
    if sub.plan.uncertain {
        anomalies.push(Anomaly::UncertainPlan {
            price_hint: None,
        });
    }

    let mut plan = sub.plan.tier;
    if sub.status.grants_access() && plan == PlanTier::Free {
        // Provider says access is granted; the conservative paid choice
        // keeps the record consistent (active/trialing implies paid plan).
        plan = PlanTier::lowest_paid();
        anomalies.push(Anomaly::FreePlanWithAccess);
    }

    // With a scheduled cancellation, the effective period end is the
    // provider's cancellation time, not the renewal time.
    let effective_end = if sub.cancel_at_period_end {
        match sub.cancel_at {
            Some(at) => PeriodEnd::authoritative(at),
            None => sub.period_end,
        }
    } else {
        sub.period_end
    };

    let mut record = current.clone();
    record.plan = plan;
    record.status = sub.status;
    record.cancel_at_period_end = sub.cancel_at_period_end;
    record.provider_subscription_id = Some(sub.subscription_id.clone());
    if sub.customer_id.is_some() {
        record.provider_customer_id = sub.customer_id.clone();
    }
    record.trial_end = sub.trial_end;
    record.billing = sub.billing.clone();

    // An estimate never overwrites an authoritative value on file
    let keep_authoritative = effective_end.estimated
        && !current.period_end_estimated
        && current.current_period_end.is_some();
    if !keep_authoritative {
        record.current_period_end = Some(effective_end.at);
        record.period_end_estimated = effective_end.estimated;
    }

    Outcome::Applied {
        record: stamp(record, request),
        anomalies,
    }
}

/// Drive the record back to free/inactive, retaining billing history for
/// display and remembering the retired subscription id.
fn force_free(
    current: &AccountSubscription,
    retired: Option<String>,
    request: &TransitionRequest,
) -> AccountSubscription {
    let mut record = current.clone();
    record.plan = PlanTier::Free;
    record.status = SubscriptionStatus::Inactive;
    record.cancel_at_period_end = false;
    record.current_period_end = None;
    record.period_end_estimated = false;
    record.trial_end = None;
    if retired.is_some() {
        record.retired_subscription_id = retired;
    }
    record.provider_subscription_id = None;
    stamp(record, request)
}

fn invoice_matches(current: &AccountSubscription, subscription_id: Option<&str>) -> bool {
    match (&current.provider_subscription_id, subscription_id) {
        (Some(live), Some(inv)) => live == inv,
        // Invoice without a subscription reference still applies when
        // exactly one subscription is on file
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn stamp(mut record: AccountSubscription, request: &TransitionRequest) -> AccountSubscription {
    if request.event_id.is_some() {
        record.last_applied_event_id = request.event_id.clone();
    }
    record.last_event_at = Some(request.occurred_at);
    record
}
