//! Billing provider webhook endpoint
//!
//! The body must stay raw bytes end to end: the signature is computed over
//! the exact bytes the provider sent. Anything that verifies gets a 2xx,
//! even when processing failed downstream, so the provider does not
//! redeliver an event the engine has already decided how to handle.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use recall_billing::WebhookAck;
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn handle_billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let ack = state
        .billing
        .coordinator
        .handle_webhook(&body, signature)
        .await?;

    let status_label = match ack {
        WebhookAck::Processed => "processed",
        WebhookAck::AlreadyApplied => "already_applied",
        WebhookAck::Ignored => "ignored",
        WebhookAck::FailedAcknowledged => "acknowledged",
    };

    Ok((
        StatusCode::OK,
        Json(json!({"received": true, "status": status_label})),
    ))
}
