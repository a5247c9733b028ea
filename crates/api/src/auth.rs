//! Bearer token authentication
//!
//! The API trusts HS256 tokens issued by the auth service; the `sub` claim
//! is the account id. Webhook and admin endpoints authenticate differently
//! and do not use this extractor.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Uuid,
    #[allow(dead_code)]
    exp: i64,
}

/// Authenticated account, extracted from the bearer token
#[derive(Debug, Clone, Copy)]
pub struct AuthAccount {
    pub account_id: Uuid,
}

impl FromRequestParts<AppState> for AuthAccount {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("expected bearer token"))?;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Token validation failed");
            ApiError::unauthorized("invalid token")
        })?;

        Ok(AuthAccount {
            account_id: data.claims.sub,
        })
    }
}
