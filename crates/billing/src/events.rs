//! Inbound event model
//!
//! Provider webhook payloads are parsed into tolerant structs: every field
//! the provider might omit is optional or defaulted, because a missing
//! field must degrade to a fallback rather than fail the pipeline. The same
//! structs are returned by the pull path, so webhook-driven and pull-driven
//! reconciliation flow through identical code.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Event types the engine reacts to. Everything else is acknowledged and
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    CheckoutCompleted,
    /// Delivered but not handled; safely ignorable
    Unhandled,
}

impl EventKind {
    pub fn from_type_str(s: &str) -> Self {
        match s {
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            // The provider emits both names depending on API version
            "invoice.paid" | "invoice.payment_succeeded" => EventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "checkout.session.completed" => EventKind::CheckoutCompleted,
            _ => EventKind::Unhandled,
        }
    }
}

/// A verified (or explicitly unverified) inbound event.
///
/// Transient: consumed once by the coordinator, then discarded. Only the
/// event id survives, in the idempotency ledger.
#[derive(Debug, Clone)]
pub struct ExternalEvent {
    pub event_id: String,
    pub event_type: String,
    pub kind: EventKind,
    /// Provider-assigned creation time, used for temporal ordering.
    /// Never the receipt time: out-of-order delivery would corrupt ordering.
    pub occurred_at: OffsetDateTime,
    /// The `data.object` of the envelope, parsed per event kind
    pub object: serde_json::Value,
    /// False when the engine runs in degraded unverified mode
    /// (no webhook secret configured). Callers must be able to
    /// distinguish this for audit.
    pub verified: bool,
    pub received_at: OffsetDateTime,
}

/// Raw webhook envelope
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
pub struct EnvelopeData {
    pub object: serde_json::Value,
}

/// Provider subscription object, as carried in subscription events and
/// returned by `ProviderClient::retrieve_subscription`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Scheduled cancellation time, present when cancel_at_period_end is set
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: ItemList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub price: Option<Price>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Price {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Recurring {
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub interval_count: Option<i64>,
}

/// Provider invoice object. Invoices are often more current than the
/// subscription object, so their period end is preferred when refreshing
/// after a successful payment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoicePayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub lines: InvoiceLines,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub period: Option<InvoicePeriod>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoicePeriod {
    #[serde(default)]
    pub end: Option<i64>,
}

/// Checkout session completion payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutSessionPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl SubscriptionPayload {
    /// First line item's price, if any
    pub fn price(&self) -> Option<&Price> {
        self.items.data.first().and_then(|item| item.price.as_ref())
    }

    pub fn price_id(&self) -> Option<&str> {
        self.price().map(|p| p.id.as_str())
    }

    pub fn plan_hint(&self) -> Option<&str> {
        self.metadata.get("plan").map(|s| s.as_str())
    }

    pub fn account_hint(&self) -> Option<&str> {
        self.metadata.get("account_id").map(|s| s.as_str())
    }
}

impl InvoicePayload {
    /// Invoice-level period end, falling back to the first line's period
    pub fn effective_period_end(&self) -> Option<i64> {
        self.period_end.or_else(|| {
            self.lines
                .data
                .first()
                .and_then(|line| line.period.as_ref())
                .and_then(|p| p.end)
        })
    }
}

impl ExternalEvent {
    pub fn subscription(&self) -> BillingResult<SubscriptionPayload> {
        serde_json::from_value(self.object.clone())
            .map_err(|e| BillingError::MalformedPayload(format!("subscription object: {}", e)))
    }

    pub fn invoice(&self) -> BillingResult<InvoicePayload> {
        serde_json::from_value(self.object.clone())
            .map_err(|e| BillingError::MalformedPayload(format!("invoice object: {}", e)))
    }

    pub fn checkout_session(&self) -> BillingResult<CheckoutSessionPayload> {
        serde_json::from_value(self.object.clone())
            .map_err(|e| BillingError::MalformedPayload(format!("checkout session: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_mapping() {
        assert_eq!(
            EventKind::from_type_str("customer.subscription.updated"),
            EventKind::SubscriptionUpdated
        );
        assert_eq!(
            EventKind::from_type_str("invoice.paid"),
            EventKind::InvoicePaymentSucceeded
        );
        assert_eq!(
            EventKind::from_type_str("invoice.payment_succeeded"),
            EventKind::InvoicePaymentSucceeded
        );
        assert_eq!(
            EventKind::from_type_str("charge.refunded"),
            EventKind::Unhandled
        );
    }

    #[test]
    fn subscription_payload_tolerates_missing_fields() {
        let payload: SubscriptionPayload = serde_json::from_str(r#"{"id": "sub_1"}"#).unwrap();
        assert_eq!(payload.id, "sub_1");
        assert!(payload.current_period_end.is_none());
        assert!(payload.price_id().is_none());
        assert!(!payload.cancel_at_period_end);
    }

    #[test]
    fn invoice_period_end_falls_back_to_line_period() {
        let payload: InvoicePayload = serde_json::from_str(
            r#"{"id": "in_1", "lines": {"data": [{"period": {"end": 1700000000}}]}}"#,
        )
        .unwrap();
        assert_eq!(payload.effective_period_end(), Some(1_700_000_000));
    }

    #[test]
    fn plan_hint_reads_metadata() {
        let payload: SubscriptionPayload = serde_json::from_str(
            r#"{"id": "sub_1", "metadata": {"plan": "pro", "account_id": "abc"}}"#,
        )
        .unwrap();
        assert_eq!(payload.plan_hint(), Some("pro"));
        assert_eq!(payload.account_hint(), Some("abc"));
    }
}
