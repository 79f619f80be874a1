//! Pre-shared API key authentication for the control surface.
//!
//! The REST endpoints under `/api/v1/devices` require an
//! `Authorization: Bearer <key>` header. The device connect upgrade and
//! `/api/v1/health` are exempt — devices authenticate through the pluggable
//! key function on the manager, not through this middleware.
//!
//! Failures use the same `{"error", "code"}` body shape as the device
//! routes, so control clients parse one error format everywhere.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Extension type carrying the expected API key, injected into the router
/// layer so [`require_api_key`] can access it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Axum middleware guarding the REST control surface.
///
/// # Error responses
///
/// - `401 Unauthorized` — `Authorization` header missing or not a Bearer token
/// - `403 Forbidden` — key present but wrong
/// - `500 Internal Server Error` — [`ApiKey`] extension not found (misconfiguration)
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(expected) = request.extensions().get::<ApiKey>().map(|key| key.0.clone()) else {
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SERVER_MISCONFIGURED",
            "API key is not configured on this route",
        );
    };

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(provided) = bearer else {
        return failure(
            StatusCode::UNAUTHORIZED,
            "MISSING_AUTHORIZATION",
            "Missing or malformed Authorization header",
        );
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return failure(StatusCode::FORBIDDEN, "INVALID_API_KEY", "Invalid API key");
    }

    next.run(request).await
}

fn failure(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": message, "code": code }))).into_response()
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// A length mismatch is folded into the accumulator rather than returned
/// early, and every byte of `expected` is visited regardless of how much of
/// `provided` exists, so response times don't leak the key length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = expected.len() ^ provided.len();
    for (i, &e) in expected.iter().enumerate() {
        // An absent byte compares as the complement, which always differs.
        let p = provided.get(i).copied().unwrap_or(!e);
        diff |= usize::from(e ^ p);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_length_mismatch_never_matches() {
        // A shared prefix must not help when lengths differ.
        assert!(!constant_time_eq(b"abc", b"abcabc"));
        assert!(!constant_time_eq(b"abcabc", b"abc"));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
