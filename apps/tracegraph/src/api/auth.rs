//! # Authentication
//!
//! Bearer-key authentication for the HTTP API. Enabled when an API key is
//! configured (`TRACEGRAPH_API_KEY`); `/health` stays open for load
//! balancer probes.

use super::types::ApiError;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// The configured key, shared with the middleware.
#[derive(Clone)]
pub struct ApiKey(Arc<str>);

impl ApiKey {
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self(Arc::from(key))
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(..)")
    }
}

/// Constant-time key comparison.
///
/// Both sides are zero-padded to a common length so the comparison always
/// covers the same number of bytes; the length check is folded in after.
fn keys_match(provided: &[u8], expected: &[u8]) -> bool {
    let len = provided.len().max(expected.len());
    let mut a = vec![0u8; len];
    let mut b = vec![0u8; len];
    a[..provided.len()].copy_from_slice(provided);
    b[..expected.len()].copy_from_slice(expected);
    let bytes_match: bool = a.ct_eq(&b).into();
    bytes_match && provided.len() == expected.len()
}

fn unauthorized() -> Response {
    ApiError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: "missing or invalid API key".to_string(),
    }
    .into_response()
}

/// Reject requests without `Authorization: Bearer <key>`.
pub async fn api_key_auth_middleware(
    State(key): State<ApiKey>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));

    match provided {
        Some(candidate) if keys_match(candidate.as_bytes(), key.0.as_bytes()) => {
            next.run(request).await
        }
        Some(_) => {
            tracing::warn!(event = "auth_failure", reason = "invalid_api_key", "authentication failed");
            unauthorized()
        }
        None => {
            tracing::warn!(
                event = "auth_failure",
                reason = "missing_authorization_header",
                "authentication failed"
            );
            unauthorized()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_match() {
        assert!(keys_match(b"secret", b"secret"));
    }

    #[test]
    fn prefix_does_not_match() {
        assert!(!keys_match(b"secre", b"secret"));
        assert!(!keys_match(b"secret\0", b"secret"));
        assert!(!keys_match(b"", b"secret"));
    }
}
