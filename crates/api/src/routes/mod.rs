//! Route definitions

mod admin;
mod subscription;
mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Provider-facing: authenticated by webhook signature
        .route("/webhooks/billing", post(webhooks::handle_billing_webhook))
        // User-facing: authenticated by bearer token
        .route("/billing/subscription", get(subscription::get_subscription))
        .route("/billing/checkout", post(subscription::create_checkout))
        .route("/billing/portal", post(subscription::create_portal))
        .route(
            "/billing/subscription/cancel",
            post(subscription::cancel_subscription),
        )
        .route(
            "/billing/subscription/resume",
            post(subscription::resume_subscription),
        )
        .route(
            "/billing/subscription/plan",
            post(subscription::change_plan),
        )
        // Operator-facing: authenticated by shared admin secret
        .route("/admin/sweep", post(admin::run_sweep))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}
