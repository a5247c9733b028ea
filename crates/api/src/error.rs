//! HTTP error mapping
//!
//! Domain errors from the billing engine map onto status codes here, in
//! one place, so handlers just use `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use recall_billing::BillingError;
use serde_json::json;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        let status = match &e {
            // Trust errors: the caller sent something we refuse to process
            BillingError::BadSignature | BillingError::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            // Domain errors: legal request, illegal in the current state
            BillingError::InvalidTransition(_) | BillingError::NoSubscription => {
                StatusCode::CONFLICT
            }
            BillingError::UnknownAccount(_) => StatusCode::NOT_FOUND,
            BillingError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            // Transient: the caller should retry
            BillingError::ProviderTimeout => StatusCode::GATEWAY_TIMEOUT,
            BillingError::WriteConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
            BillingError::ProviderApi(_) => StatusCode::BAD_GATEWAY,
            BillingError::Database(_) | BillingError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Internal detail stays in the logs, not in the response body
        let message = if status.is_server_error() {
            tracing::error!(error = %e, "Billing operation failed");
            "internal error".to_string()
        } else {
            e.to_string()
        };

        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}
