//! Webhook event verification
//!
//! Recomputes the provider signature over the raw, unparsed body and
//! compares it in constant time. The body must arrive as raw bytes: the
//! signature is computed over the exact bytes the provider sent, and any
//! re-serialization would invalidate it.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{EventEnvelope, EventKind, ExternalEvent};

type HmacSha256 = Hmac<Sha256>;

/// Reject signatures whose embedded timestamp is older than this,
/// to bound replay of captured deliveries.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verifies inbound webhook payloads against the shared webhook secret.
///
/// When no secret is configured the verifier runs in a degraded
/// "unverified" mode: events are still parsed and processed, but marked
/// `verified = false` and logged for audit.
#[derive(Clone)]
pub struct EventVerifier {
    webhook_secret: Option<String>,
}

impl EventVerifier {
    pub fn new(webhook_secret: Option<String>) -> Self {
        if webhook_secret.is_none() {
            tracing::warn!(
                "No webhook secret configured - running in UNVERIFIED mode; \
                 inbound events will not be authenticated"
            );
        }
        Self { webhook_secret }
    }

    /// Verify a raw webhook delivery and parse it into an [`ExternalEvent`].
    ///
    /// No side effects; callers decide what to do with trust failures.
    pub fn verify(&self, raw_body: &[u8], signature_header: &str) -> BillingResult<ExternalEvent> {
        let verified = match &self.webhook_secret {
            Some(secret) => {
                self.check_signature(raw_body, signature_header, secret)?;
                true
            }
            None => {
                tracing::warn!("Accepting webhook without signature verification (no secret)");
                false
            }
        };

        let envelope: EventEnvelope = serde_json::from_slice(raw_body)
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        let occurred_at = OffsetDateTime::from_unix_timestamp(envelope.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        Ok(ExternalEvent {
            kind: EventKind::from_type_str(&envelope.event_type),
            event_id: envelope.id,
            event_type: envelope.event_type,
            occurred_at,
            object: envelope.data.object,
            verified,
            received_at: OffsetDateTime::now_utc(),
        })
    }

    /// Signature header format: `t=<unix>,v1=<hex hmac>[,v0=...]`
    /// where the signed payload is `"{t}.{raw_body}"`.
    fn check_signature(
        &self,
        raw_body: &[u8],
        signature_header: &str,
        secret: &str,
    ) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature_header.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1]),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            BillingError::BadSignature
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            BillingError::BadSignature
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook signature timestamp outside tolerance"
            );
            return Err(BillingError::BadSignature);
        }

        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::BadSignature
        })?;
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(raw_body);
        let computed = hex::encode(mac.finalize().into_bytes());

        if !bool::from(computed.as_bytes().ct_eq(v1_signature.as_bytes())) {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::BadSignature);
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret_key";

    fn sign(body: &[u8], secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(body);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn event_body() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_123",
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": {"object": {"id": "sub_1", "status": "active"}}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_signature_passes() {
        let verifier = EventVerifier::new(Some(SECRET.to_string()));
        let body = event_body();
        let header = sign(&body, SECRET, OffsetDateTime::now_utc().unix_timestamp());

        let event = verifier.verify(&body, &header).unwrap();
        assert!(event.verified);
        assert_eq!(event.event_id, "evt_123");
        assert_eq!(event.kind, EventKind::SubscriptionUpdated);
        assert_eq!(event.occurred_at.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn tampered_body_rejected() {
        let verifier = EventVerifier::new(Some(SECRET.to_string()));
        let body = event_body();
        let header = sign(&body, SECRET, OffsetDateTime::now_utc().unix_timestamp());

        let mut tampered = body.clone();
        tampered.extend_from_slice(b" ");
        let err = verifier.verify(&tampered, &header).unwrap_err();
        assert!(matches!(err, BillingError::BadSignature));
    }

    #[test]
    fn wrong_secret_rejected() {
        let verifier = EventVerifier::new(Some(SECRET.to_string()));
        let body = event_body();
        let header = sign(&body, "whsec_other", OffsetDateTime::now_utc().unix_timestamp());

        let err = verifier.verify(&body, &header).unwrap_err();
        assert!(matches!(err, BillingError::BadSignature));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let verifier = EventVerifier::new(Some(SECRET.to_string()));
        let body = event_body();
        let stale = OffsetDateTime::now_utc().unix_timestamp() - 3600;
        let header = sign(&body, SECRET, stale);

        let err = verifier.verify(&body, &header).unwrap_err();
        assert!(matches!(err, BillingError::BadSignature));
    }

    #[test]
    fn unverified_mode_parses_and_flags() {
        let verifier = EventVerifier::new(None);
        let body = event_body();

        let event = verifier.verify(&body, "").unwrap();
        assert!(!event.verified);
        assert_eq!(event.event_id, "evt_123");
    }

    #[test]
    fn malformed_json_after_passing_signature() {
        let verifier = EventVerifier::new(Some(SECRET.to_string()));
        let body = b"not json".to_vec();
        let header = sign(&body, SECRET, OffsetDateTime::now_utc().unix_timestamp());

        let err = verifier.verify(&body, &header).unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }

    #[test]
    fn garbage_header_rejected() {
        let verifier = EventVerifier::new(Some(SECRET.to_string()));
        let err = verifier.verify(&event_body(), "v1=zzzz").unwrap_err();
        assert!(matches!(err, BillingError::BadSignature));
    }
}
