//! Billing error types

use thiserror::Error;

/// Errors produced by the reconciliation engine
#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook signature did not match the shared secret
    #[error("webhook signature verification failed")]
    BadSignature,

    /// Event body was not parseable after the signature check
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// Required provider configuration is missing
    #[error("billing provider not configured: {0}")]
    NotConfigured(String),

    /// The billing provider API returned an error
    #[error("provider API error: {0}")]
    ProviderApi(String),

    /// The billing provider API did not respond within the deadline.
    /// The local record is left untouched; the caller must not assume
    /// the provider applied the change.
    #[error("provider API timed out")]
    ProviderTimeout,

    /// Database failure
    #[error("database error: {0}")]
    Database(String),

    /// Optimistic write lost the race against a concurrent writer
    #[error("concurrent update conflict for account {0}")]
    WriteConflict(uuid::Uuid),

    /// The requested transition is not legal in the current state
    /// (e.g. resuming a subscription that is not scheduled for cancellation)
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// An event could not be attributed to any account
    #[error("could not resolve account for event: {0}")]
    UnknownAccount(String),

    /// A user action requires an active provider subscription on file
    #[error("account has no provider subscription on file")]
    NoSubscription,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BillingError::ProviderTimeout
        } else {
            BillingError::ProviderApi(e.to_string())
        }
    }
}

impl BillingError {
    /// Whether the caller may safely retry the operation.
    /// Domain errors and trust errors are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::ProviderTimeout
                | BillingError::Database(_)
                | BillingError::WriteConflict(_)
        )
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BillingError::ProviderTimeout.is_transient());
        assert!(BillingError::WriteConflict(uuid::Uuid::new_v4()).is_transient());
        assert!(!BillingError::BadSignature.is_transient());
        assert!(!BillingError::InvalidTransition("resume".into()).is_transient());
    }
}
