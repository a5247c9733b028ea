//! Operator endpoints, authenticated by the shared admin secret

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use recall_billing::SweepSummary;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-admin-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let matches: bool = provided
        .as_bytes()
        .ct_eq(state.config.admin_secret.as_bytes())
        .into();
    if !matches {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok(())
}

/// Manually trigger the expiration sweep. The worker runs this on a
/// schedule; this endpoint exists for operators and incident recovery.
pub async fn run_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SweepSummary>, ApiError> {
    require_admin(&state, &headers)?;
    let summary = state.billing.coordinator.run_sweep().await?;
    Ok(Json(summary))
}
