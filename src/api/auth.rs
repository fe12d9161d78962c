// =============================================================================
// Bearer Token Authentication — Axum extractors
// =============================================================================
//
// `AuthSession` resolves the caller's bearer token (Authorization header or
// `?token=` query parameter) against the session manager, spending one
// rate-limit token per request. `AdminBearer` guards the operational
// endpoints with the static token from `HELIOS_ADMIN_TOKEN`, compared in
// constant time.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::warn;

use super::{ApiError, AppCtx};
use crate::errors::CoreError;

/// Pull a bearer token out of the Authorization header or the query string.
fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    let query = parts.uri.query()?;
    for pair in query.split('&') {
        if let Some(token) = pair.strip_prefix("token=") {
            return Some(token.to_string());
        }
    }
    None
}

/// An authenticated client session.
pub struct AuthSession {
    pub token: String,
    pub account_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppCtx>> for AuthSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppCtx>,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_token(parts).ok_or(ApiError(CoreError::AuthRequired))?;
        let account_id = state.sessions.authorize(&token)?;
        Ok(Self { token, account_id })
    }
}

// ---------------------------------------------------------------------------
// Admin token
// ---------------------------------------------------------------------------

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Extractor guarding `/admin/*` with the `HELIOS_ADMIN_TOKEN` env token.
pub struct AdminBearer;

#[async_trait]
impl FromRequestParts<Arc<AppCtx>> for AdminBearer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<AppCtx>,
    ) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("HELIOS_ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("HELIOS_ADMIN_TOKEN not set, admin endpoints disabled");
            return Err(ApiError(CoreError::Forbidden));
        }
        let token = extract_token(parts).ok_or(ApiError(CoreError::AuthRequired))?;
        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(ApiError(CoreError::Forbidden));
        }
        Ok(Self)
    }
}
