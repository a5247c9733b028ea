//! Period Calculator
//!
//! Derives the authoritative "current billing period end" for a
//! subscription. The provider's explicit field wins when present; otherwise
//! a fallback is computed from the billing interval. Estimated values are
//! tagged so a later authoritative value always replaces them, while an
//! estimate never replaces an authoritative value.

use time::{Duration, OffsetDateTime};

use crate::events::SubscriptionPayload;

/// A period end plus its provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodEnd {
    pub at: OffsetDateTime,
    /// True when computed locally rather than read from the provider
    pub estimated: bool,
}

impl PeriodEnd {
    pub fn authoritative(at: OffsetDateTime) -> Self {
        Self { at, estimated: false }
    }

    pub fn estimated(at: OffsetDateTime) -> Self {
        Self { at, estimated: true }
    }
}

/// Compute the current period end for a subscription payload.
///
/// Fallback when the provider omitted the field:
/// `now + interval_count x interval`, defaulting to one month when the
/// interval itself is unavailable. Calendar-exact month arithmetic is
/// unnecessary for an estimate; the next authoritative event corrects it.
pub fn current_period_end(payload: &SubscriptionPayload, now: OffsetDateTime) -> PeriodEnd {
    if let Some(ts) = payload.current_period_end {
        if let Ok(at) = OffsetDateTime::from_unix_timestamp(ts) {
            return PeriodEnd::authoritative(at);
        }
        tracing::warn!(
            subscription_id = %payload.id,
            raw = ts,
            "Provider period end out of range, falling back to estimate"
        );
    }

    let recurring = payload.price().and_then(|p| p.recurring.as_ref());
    let count = recurring
        .and_then(|r| r.interval_count)
        .filter(|c| *c > 0)
        .unwrap_or(1);
    let unit = match recurring.and_then(|r| r.interval.as_deref()) {
        Some("day") => Duration::days(1),
        Some("week") => Duration::weeks(1),
        Some("month") => Duration::days(30),
        Some("year") => Duration::days(365),
        Some(other) => {
            tracing::warn!(
                subscription_id = %payload.id,
                interval = %other,
                "Unknown billing interval, assuming one month"
            );
            Duration::days(30)
        }
        None => Duration::days(30),
    };

    PeriodEnd::estimated(now + unit * count as i32)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn payload(json: serde_json::Value) -> SubscriptionPayload {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn explicit_period_end_is_authoritative() {
        let p = payload(serde_json::json!({
            "id": "sub_1",
            "current_period_end": 1_750_000_000,
        }));
        let end = current_period_end(&p, OffsetDateTime::now_utc());
        assert!(!end.estimated);
        assert_eq!(end.at.unix_timestamp(), 1_750_000_000);
    }

    #[test]
    fn monthly_interval_estimates_thirty_days() {
        let p = payload(serde_json::json!({
            "id": "sub_1",
            "items": {"data": [{"price": {"id": "price_1", "recurring": {"interval": "month", "interval_count": 1}}}]},
        }));
        let now = OffsetDateTime::now_utc();
        let end = current_period_end(&p, now);
        assert!(end.estimated);
        assert_eq!(end.at, now + Duration::days(30));
    }

    #[test]
    fn interval_count_multiplies() {
        let p = payload(serde_json::json!({
            "id": "sub_1",
            "items": {"data": [{"price": {"id": "price_1", "recurring": {"interval": "week", "interval_count": 2}}}]},
        }));
        let now = OffsetDateTime::now_utc();
        let end = current_period_end(&p, now);
        assert!(end.estimated);
        assert_eq!(end.at, now + Duration::weeks(2));
    }

    #[test]
    fn missing_interval_defaults_to_one_month() {
        let p = payload(serde_json::json!({"id": "sub_1"}));
        let now = OffsetDateTime::now_utc();
        let end = current_period_end(&p, now);
        assert!(end.estimated);
        assert_eq!(end.at, now + Duration::days(30));
    }

    #[test]
    fn yearly_interval() {
        let p = payload(serde_json::json!({
            "id": "sub_1",
            "items": {"data": [{"price": {"id": "price_1", "recurring": {"interval": "year"}}}]},
        }));
        let now = OffsetDateTime::now_utc();
        let end = current_period_end(&p, now);
        assert_eq!(end.at, now + Duration::days(365));
    }
}
