use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

use crate::error::EngineError;
use crate::handlers::AppState;

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Compares digests so the comparison time does not depend on the common prefix.
pub fn check_token(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn verify_request(headers: &HeaderMap, expected: Option<&str>) -> Result<(), EngineError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let token = extract_bearer(headers).ok_or(EngineError::Unauthorized)?;
    if !check_token(token, expected) {
        return Err(EngineError::Forbidden);
    }
    Ok(())
}

pub async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, EngineError> {
    if let Err(e) = verify_request(request.headers(), state.config.auth_token.as_deref()) {
        warn!(path = %request.uri().path(), error = %e, "Rejected request");
        return Err(e);
    }
    Ok(next.run(request).await)
}
