//! User-facing subscription endpoints

use axum::extract::State;
use axum::Json;
use recall_billing::{AccountSubscription, BillingError, PlanTier};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::auth::AuthAccount;
use crate::error::ApiError;
use crate::state::AppState;

/// What the frontend sees of the subscription record
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub plan: PlanTier,
    pub status: String,
    pub has_access: bool,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub period_end_estimated: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<String>,
}

impl From<AccountSubscription> for SubscriptionResponse {
    fn from(record: AccountSubscription) -> Self {
        Self {
            plan: record.plan,
            status: record.status.as_str().to_string(),
            has_access: record.status.grants_access(),
            cancel_at_period_end: record.cancel_at_period_end,
            current_period_end: record.current_period_end,
            period_end_estimated: record.period_end_estimated,
            trial_end: record.trial_end,
            amount_cents: record.billing.amount_cents,
            currency: record.billing.currency,
            interval: record.billing.interval,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub plan: String,
}

fn parse_plan(s: &str) -> Result<PlanTier, ApiError> {
    PlanTier::parse(s).ok_or_else(|| {
        ApiError::new(
            axum::http::StatusCode::BAD_REQUEST,
            format!("unknown plan '{}'", s),
        )
    })
}

/// The settings screen view. Pulls current truth from the provider so the
/// user never sees a record that webhook lag left behind; degrades to the
/// local record when the provider is unreachable.
pub async fn get_subscription(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let record = match state.billing.coordinator.pull(auth.account_id).await {
        Ok(record) => record,
        Err(e) if e.is_transient() || matches!(e, BillingError::ProviderApi(_)) => {
            tracing::warn!(
                account_id = %auth.account_id,
                error = %e,
                "Pull failed, serving local subscription record"
            );
            state.billing.coordinator.current(auth.account_id).await?
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Json(record.into()))
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    auth: AuthAccount,
    Json(req): Json<PlanRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let tier = parse_plan(&req.plan)?;
    let session = state
        .billing
        .coordinator
        .checkout(auth.account_id, tier)
        .await?;
    tracing::info!(account_id = %auth.account_id, plan = %tier, "Checkout session created");
    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

pub async fn create_portal(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> Result<Json<PortalResponse>, ApiError> {
    let session = state.billing.coordinator.portal(auth.account_id).await?;
    Ok(Json(PortalResponse { url: session.url }))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let record = state.billing.coordinator.cancel(auth.account_id).await?;
    Ok(Json(record.into()))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let record = state.billing.coordinator.resume(auth.account_id).await?;
    Ok(Json(record.into()))
}

pub async fn change_plan(
    State(state): State<AppState>,
    auth: AuthAccount,
    Json(req): Json<PlanRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let tier = parse_plan(&req.plan)?;
    let record = state
        .billing
        .coordinator
        .change_plan(auth.account_id, tier)
        .await?;
    Ok(Json(record.into()))
}
