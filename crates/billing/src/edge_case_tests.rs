// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! End-to-end edge case tests for the reconciliation pipeline.
//!
//! These drive the coordinator through raw signed webhook bodies, the way
//! production traffic arrives, against in-memory store/ledger and a mock
//! provider. Each scenario is numbered and self-contained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::{CheckoutSession, PortalSession, ProviderClient, StripeConfig};
use crate::coordinator::{ReconciliationCoordinator, WebhookAck};
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionPayload;
use crate::ledger::{IdempotencyLedger, InMemoryEventLedger};
use crate::plan::PlanTier;
use crate::state_machine::{AccountSubscription, SubscriptionStatus};
use crate::store::{InMemorySubscriptionStore, SubscriptionStore};

const SECRET: &str = "whsec_edge_case_secret";

// ----------------------------------------------------------------------
// Mock provider
// ----------------------------------------------------------------------

#[derive(Default)]
struct MockProvider {
    subscriptions: Mutex<HashMap<String, SubscriptionPayload>>,
    fail_retrievals: AtomicBool,
    timeout_updates: AtomicBool,
    update_calls: AtomicUsize,
}

impl MockProvider {
    async fn insert(&self, payload: SubscriptionPayload) {
        self.subscriptions
            .lock()
            .await
            .insert(payload.id.clone(), payload);
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionPayload> {
        if self.fail_retrievals.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderApi("mock retrieval failure".into()));
        }
        self.subscriptions
            .lock()
            .await
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::ProviderApi("no such subscription".into()))
    }

    async fn create_checkout_session(
        &self,
        _customer_id: Option<&str>,
        _price_id: &str,
        _metadata: &HashMap<String, String>,
    ) -> BillingResult<CheckoutSession> {
        Ok(CheckoutSession {
            id: "cs_mock_1".to_string(),
            url: Some("https://checkout.mock/cs_mock_1".to_string()),
        })
    }

    async fn create_portal_session(&self, _customer_id: &str) -> BillingResult<PortalSession> {
        Ok(PortalSession {
            url: "https://portal.mock/session".to_string(),
        })
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<SubscriptionPayload> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.timeout_updates.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderTimeout);
        }
        let mut subs = self.subscriptions.lock().await;
        let payload = subs
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::ProviderApi("no such subscription".into()))?;
        payload.cancel_at_period_end = cancel;
        Ok(payload.clone())
    }

    async fn change_price(
        &self,
        subscription_id: &str,
        new_price_id: &str,
        plan_hint: &str,
    ) -> BillingResult<SubscriptionPayload> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.timeout_updates.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderTimeout);
        }
        let mut subs = self.subscriptions.lock().await;
        let payload = subs
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::ProviderApi("no such subscription".into()))?;
        if let Some(item) = payload.items.data.first_mut() {
            if let Some(price) = item.price.as_mut() {
                price.id = new_price_id.to_string();
            }
        }
        payload
            .metadata
            .insert("plan".to_string(), plan_hint.to_string());
        Ok(payload.clone())
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionPayload> {
        let mut subs = self.subscriptions.lock().await;
        let payload = subs
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::ProviderApi("no such subscription".into()))?;
        payload.status = "canceled".to_string();
        Ok(payload.clone())
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Harness {
    coordinator: Arc<ReconciliationCoordinator>,
    provider: Arc<MockProvider>,
    store: Arc<InMemorySubscriptionStore>,
    ledger: Arc<InMemoryEventLedger>,
}

fn test_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_edge".to_string(),
        webhook_secret: Some(SECRET.to_string()),
        starter_price_id: "price_starter".to_string(),
        pro_price_id: "price_pro".to_string(),
        team_price_id: "price_team".to_string(),
        checkout_success_url: "https://app.test/success".to_string(),
        checkout_cancel_url: "https://app.test/cancel".to_string(),
        portal_return_url: "https://app.test/billing".to_string(),
        api_base: "https://unused.test".to_string(),
    }
}

fn harness() -> Harness {
    let provider = Arc::new(MockProvider::default());
    let store = Arc::new(InMemorySubscriptionStore::new());
    let ledger = Arc::new(InMemoryEventLedger::new());
    let coordinator = Arc::new(ReconciliationCoordinator::new(
        provider.clone(),
        ledger.clone(),
        store.clone(),
        test_config(),
    ));
    Harness {
        coordinator,
        provider,
        store,
        ledger,
    }
}

/// Sign a raw body the way the provider does: `t=<unix>,v1=<hmac hex>`
/// over `"{t}.{body}"`. The header timestamp is always "now" so the
/// replay tolerance check passes; event ordering uses the envelope's
/// `created` field, which the tests control independently.
fn sign(body: &[u8]) -> String {
    let key = SECRET.strip_prefix("whsec_").unwrap();
    let t = OffsetDateTime::now_utc().unix_timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
    mac.update(format!("{}.", t).as_bytes());
    mac.update(body);
    format!("t={},v1={}", t, hex::encode(mac.finalize().into_bytes()))
}

fn event_body(
    event_id: &str,
    event_type: &str,
    created: i64,
    object: serde_json::Value,
) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "created": created,
        "data": {"object": object}
    })
    .to_string()
    .into_bytes()
}

fn subscription_object(
    sub_id: &str,
    status: &str,
    account_id: Uuid,
    plan: &str,
    period_end: Option<i64>,
) -> serde_json::Value {
    serde_json::json!({
        "id": sub_id,
        "customer": "cus_edge",
        "status": status,
        "cancel_at_period_end": false,
        "current_period_end": period_end,
        "metadata": {"account_id": account_id.to_string(), "plan": plan},
        "items": {"data": [{"id": "si_1", "price": {
            "id": "price_unlisted",
            "unit_amount": 1500,
            "currency": "usd",
            "recurring": {"interval": "month", "interval_count": 1}
        }}]}
    })
}

async fn deliver(h: &Harness, body: &[u8]) -> WebhookAck {
    h.coordinator
        .handle_webhook(body, &sign(body))
        .await
        .unwrap()
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

/// Scenario 1: the full lifecycle.
/// Checkout completes (subscription has no period end yet, plan only in
/// session metadata) -> estimated period end; authoritative update
/// replaces the estimate; failed invoice -> grace period; user cancels;
/// sweep expires the lapsed record back to free.
#[tokio::test]
async fn scenario_full_lifecycle() {
    let h = harness();
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    // Provider knows the subscription, but without a period end and
    // without plan metadata yet
    h.provider
        .insert(
            serde_json::from_value(serde_json::json!({
                "id": "sub_life",
                "customer": "cus_edge",
                "status": "active",
                "cancel_at_period_end": false,
                "items": {"data": [{"id": "si_1", "price": {
                    "id": "price_unlisted",
                    "unit_amount": 1500,
                    "currency": "usd",
                    "recurring": {"interval": "month", "interval_count": 1}
                }}]}
            }))
            .unwrap(),
        )
        .await;

    // Step 1: checkout.session.completed carries the attribution
    let body = event_body(
        "evt_checkout",
        "checkout.session.completed",
        now,
        serde_json::json!({
            "id": "cs_life",
            "customer": "cus_edge",
            "subscription": "sub_life",
            "metadata": {"account_id": account.to_string(), "plan": "pro"}
        }),
    );
    assert_eq!(deliver(&h, &body).await, WebhookAck::Processed);

    let record = h.store.get(account).await.unwrap();
    assert_eq!(record.plan, PlanTier::Pro);
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(record.provider_subscription_id.as_deref(), Some("sub_life"));
    assert_eq!(record.provider_customer_id.as_deref(), Some("cus_edge"));
    // No period end from the provider: estimated one month out
    assert!(record.period_end_estimated);
    let estimate = record.current_period_end.unwrap().unix_timestamp();
    assert!(estimate > now + 29 * 86_400 && estimate < now + 31 * 86_400);

    // Step 2: authoritative period end replaces the estimate. Already in
    // the past, so the sweep at the end of the scenario can fire.
    let authoritative_end = now - 10;
    let body = event_body(
        "evt_update",
        "customer.subscription.updated",
        now + 1,
        subscription_object("sub_life", "active", account, "pro", Some(authoritative_end)),
    );
    assert_eq!(deliver(&h, &body).await, WebhookAck::Processed);
    let record = h.store.get(account).await.unwrap();
    assert!(!record.period_end_estimated);
    assert_eq!(
        record.current_period_end.unwrap().unix_timestamp(),
        authoritative_end
    );

    // Step 3: failed invoice -> past_due, access-relevant fields intact
    let body = event_body(
        "evt_fail",
        "invoice.payment_failed",
        now + 2,
        serde_json::json!({"id": "in_1", "customer": "cus_edge", "subscription": "sub_life"}),
    );
    assert_eq!(deliver(&h, &body).await, WebhookAck::Processed);
    let record = h.store.get(account).await.unwrap();
    assert_eq!(record.status, SubscriptionStatus::PastDue);
    assert_eq!(record.plan, PlanTier::Pro);

    // Step 4: user schedules cancellation
    let record = h.coordinator.cancel(account).await.unwrap();
    assert!(record.cancel_at_period_end);
    assert_eq!(h.provider.update_calls.load(Ordering::SeqCst), 1);

    // Step 5: the period end has lapsed, so the sweep expires the record
    let summary = h.coordinator.run_sweep().await.unwrap();
    assert!(!summary.skipped);
    assert_eq!(summary.expired, 1);
    let record = h.store.get(account).await.unwrap();
    assert_eq!(record.plan, PlanTier::Free);
    assert_eq!(record.status, SubscriptionStatus::Inactive);
    assert!(!record.cancel_at_period_end);
    assert!(record.current_period_end.is_none());
    assert_eq!(record.retired_subscription_id.as_deref(), Some("sub_life"));
}

/// Scenario 2: redelivery of an already-applied event is a cheap no-op
#[tokio::test]
async fn scenario_duplicate_delivery_short_circuits() {
    let h = harness();
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let body = event_body(
        "evt_dup",
        "customer.subscription.created",
        now,
        subscription_object("sub_dup", "active", account, "starter", Some(now + 86_400)),
    );

    assert_eq!(deliver(&h, &body).await, WebhookAck::Processed);
    let version_after_first = h.store.get(account).await.unwrap().version;

    assert_eq!(deliver(&h, &body).await, WebhookAck::AlreadyApplied);
    let record = h.store.get(account).await.unwrap();
    assert_eq!(record.version, version_after_first);
    assert_eq!(h.ledger.len().await, 1);
}

/// Scenario 3: a late-arriving older event never rolls the record back
#[tokio::test]
async fn scenario_out_of_order_events_converge() {
    let h = harness();
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let newer = event_body(
        "evt_newer",
        "customer.subscription.updated",
        now,
        subscription_object("sub_ooo", "active", account, "pro", Some(now + 86_400)),
    );
    assert_eq!(deliver(&h, &newer).await, WebhookAck::Processed);

    // Older event (earlier provider timestamp, different id) arrives late
    // claiming past_due; it is acknowledged but discarded
    let older = event_body(
        "evt_older",
        "customer.subscription.updated",
        now - 100,
        subscription_object("sub_ooo", "past_due", account, "pro", Some(now + 86_400)),
    );
    assert_eq!(deliver(&h, &older).await, WebhookAck::Processed);

    let record = h.store.get(account).await.unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    // The discarded event is still ledgered so redelivery short-circuits
    assert!(h.ledger.has_been_applied("evt_older").await.unwrap());
}

/// Scenario 4: unhandled event types are acknowledged without side effects
#[tokio::test]
async fn scenario_unhandled_event_type_ignored() {
    let h = harness();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let body = event_body(
        "evt_refund",
        "charge.refunded",
        now,
        serde_json::json!({"id": "re_1"}),
    );
    assert_eq!(deliver(&h, &body).await, WebhookAck::Ignored);
    assert!(h.ledger.is_empty().await);
}

/// Scenario 5: trust failures are surfaced, not acknowledged
#[tokio::test]
async fn scenario_bad_signature_is_rejected() {
    let h = harness();
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let body = event_body(
        "evt_forged",
        "customer.subscription.updated",
        now,
        subscription_object("sub_forged", "active", account, "team", Some(now + 86_400)),
    );

    let err = h
        .coordinator
        .handle_webhook(&body, "t=1,v1=deadbeef")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::BadSignature));

    let record = h.store.get(account).await.unwrap();
    assert_eq!(record.plan, PlanTier::Free);
    assert!(h.ledger.is_empty().await);
}

/// Scenario 6: failures after verification are swallowed into an ack,
/// and the event stays out of the ledger so a redelivery can retry
#[tokio::test]
async fn scenario_downstream_failure_is_acknowledged() {
    let h = harness();
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    h.provider.fail_retrievals.store(true, Ordering::SeqCst);

    let body = event_body(
        "evt_broken",
        "checkout.session.completed",
        now,
        serde_json::json!({
            "id": "cs_broken",
            "subscription": "sub_broken",
            "metadata": {"account_id": account.to_string(), "plan": "pro"}
        }),
    );
    assert_eq!(deliver(&h, &body).await, WebhookAck::FailedAcknowledged);
    assert!(h.ledger.is_empty().await);
    assert_eq!(h.store.get(account).await.unwrap().plan, PlanTier::Free);

    // Redelivery after the provider recovers succeeds
    h.provider.fail_retrievals.store(false, Ordering::SeqCst);
    h.provider
        .insert(
            serde_json::from_value(subscription_object(
                "sub_broken",
                "active",
                account,
                "pro",
                Some(now + 86_400),
            ))
            .unwrap(),
        )
        .await;
    assert_eq!(deliver(&h, &body).await, WebhookAck::Processed);
    assert_eq!(h.store.get(account).await.unwrap().plan, PlanTier::Pro);
}

/// Scenario 7: the pull path reads provider truth and forces
/// a reconciling write, including driving a canceled subscription to free
#[tokio::test]
async fn scenario_pull_reconciles_provider_truth() {
    let h = harness();
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let mut seeded = AccountSubscription::new_free(account);
    seeded.plan = PlanTier::Pro;
    seeded.status = SubscriptionStatus::Active;
    seeded.provider_subscription_id = Some("sub_pull".to_string());
    h.store.seed(seeded).await;

    // Provider truth moved on without a webhook landing
    h.provider
        .insert(
            serde_json::from_value(subscription_object(
                "sub_pull",
                "past_due",
                account,
                "pro",
                Some(now + 86_400),
            ))
            .unwrap(),
        )
        .await;

    let record = h.coordinator.pull(account).await.unwrap();
    assert_eq!(record.status, SubscriptionStatus::PastDue);

    // Provider now reports the subscription fully canceled
    h.provider.cancel_subscription("sub_pull").await.unwrap();
    let record = h.coordinator.pull(account).await.unwrap();
    assert_eq!(record.plan, PlanTier::Free);
    assert_eq!(record.status, SubscriptionStatus::Inactive);
    assert_eq!(record.retired_subscription_id.as_deref(), Some("sub_pull"));

    // Pull with nothing on file is a plain read
    let other = Uuid::new_v4();
    let record = h.coordinator.pull(other).await.unwrap();
    assert_eq!(record.plan, PlanTier::Free);
}

/// Scenario 8: a provider timeout during a user action leaves the local
/// record untouched
#[tokio::test]
async fn scenario_cancel_timeout_leaves_record_untouched() {
    let h = harness();
    let account = Uuid::new_v4();

    let mut seeded = AccountSubscription::new_free(account);
    seeded.plan = PlanTier::Starter;
    seeded.status = SubscriptionStatus::Active;
    seeded.provider_subscription_id = Some("sub_to".to_string());
    h.store.seed(seeded).await;

    h.provider.timeout_updates.store(true, Ordering::SeqCst);
    let err = h.coordinator.cancel(account).await.unwrap_err();
    assert!(matches!(err, BillingError::ProviderTimeout));

    let record = h.store.get(account).await.unwrap();
    assert!(!record.cancel_at_period_end);
    assert_eq!(record.status, SubscriptionStatus::Active);
}

/// Scenario 9: illegal user actions fail fast without touching the provider
#[tokio::test]
async fn scenario_invalid_user_actions_are_domain_errors() {
    let h = harness();
    let account = Uuid::new_v4();

    // Resume with no pending cancellation: rejected before any provider call
    let err = h.coordinator.resume(account).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));
    assert_eq!(h.provider.update_calls.load(Ordering::SeqCst), 0);

    // Cancel with no subscription on file
    let err = h.coordinator.cancel(account).await.unwrap_err();
    assert!(matches!(err, BillingError::NoSubscription));

    // Checkout for the free tier
    let err = h
        .coordinator
        .checkout(account, PlanTier::Free)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));

    // Portal without a provider customer on file
    let err = h.coordinator.portal(account).await.unwrap_err();
    assert!(matches!(err, BillingError::NoSubscription));
}

/// Scenario 10: plan change swaps the price at the provider and applies
/// the refreshed payload locally
#[tokio::test]
async fn scenario_change_plan_applies_provider_response() {
    let h = harness();
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let mut seeded = AccountSubscription::new_free(account);
    seeded.plan = PlanTier::Starter;
    seeded.status = SubscriptionStatus::Active;
    seeded.provider_subscription_id = Some("sub_cp".to_string());
    h.store.seed(seeded).await;

    h.provider
        .insert(
            serde_json::from_value(subscription_object(
                "sub_cp",
                "active",
                account,
                "starter",
                Some(now + 86_400),
            ))
            .unwrap(),
        )
        .await;

    let record = h
        .coordinator
        .change_plan(account, PlanTier::Team)
        .await
        .unwrap();
    assert_eq!(record.plan, PlanTier::Team);
    assert_eq!(record.status, SubscriptionStatus::Active);

    // Downgrade to free is not a plan change
    let err = h
        .coordinator
        .change_plan(account, PlanTier::Free)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));
}

/// Scenario 11: concurrent deliveries of the same event apply exactly once
#[tokio::test]
async fn scenario_concurrent_duplicate_deliveries() {
    let h = harness();
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let body = event_body(
        "evt_race",
        "customer.subscription.created",
        now,
        subscription_object("sub_race", "active", account, "pro", Some(now + 86_400)),
    );

    let mut handles = vec![];
    for _ in 0..4 {
        let coordinator = h.coordinator.clone();
        let body = body.clone();
        let header = sign(&body);
        handles.push(tokio::spawn(async move {
            coordinator.handle_webhook(&body, &header).await.unwrap()
        }));
    }
    for handle in handles {
        // Every delivery is acknowledged, whichever way the race went
        let ack = handle.await.unwrap();
        assert!(matches!(
            ack,
            WebhookAck::Processed | WebhookAck::AlreadyApplied
        ));
    }

    let record = h.store.get(account).await.unwrap();
    assert_eq!(record.plan, PlanTier::Pro);
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(h.ledger.len().await, 1);
    // The duplicate-event-id guard means exactly one write happened
    assert_eq!(record.version, 1);
}

/// Scenario 12: invoice events that cannot be attributed are ignored and
/// left out of the ledger
#[tokio::test]
async fn scenario_unattributable_invoice_ignored() {
    let h = harness();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let body = event_body(
        "evt_orphan",
        "invoice.payment_succeeded",
        now,
        serde_json::json!({"id": "in_orphan", "subscription": "sub_unknown"}),
    );
    assert_eq!(deliver(&h, &body).await, WebhookAck::Ignored);
    assert!(h.ledger.is_empty().await);
}

/// Scenario 13: invoice success reactivates a past_due record and
/// refreshes the period end from the invoice
#[tokio::test]
async fn scenario_invoice_success_recovers_grace_period() {
    let h = harness();
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let mut seeded = AccountSubscription::new_free(account);
    seeded.plan = PlanTier::Pro;
    seeded.status = SubscriptionStatus::PastDue;
    seeded.provider_subscription_id = Some("sub_gr".to_string());
    h.store.seed(seeded).await;

    let body = event_body(
        "evt_paid",
        "invoice.paid",
        now,
        serde_json::json!({
            "id": "in_gr",
            "subscription": "sub_gr",
            "lines": {"data": [{"period": {"end": now + 2_592_000}}]}
        }),
    );
    assert_eq!(deliver(&h, &body).await, WebhookAck::Processed);

    let record = h.store.get(account).await.unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(
        record.current_period_end.unwrap().unix_timestamp(),
        now + 2_592_000
    );
    assert!(!record.period_end_estimated);
}
