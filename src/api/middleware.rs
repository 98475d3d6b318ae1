//! Minimal API key guard. Not a session/auth system — a single shared
//! secret compared against the `X-API-Key` header, enabled only when
//! `api_key_enabled` is set (defaults on in production, off otherwise).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

pub async fn api_key_guard(
    enabled: bool,
    expected: Option<String>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !enabled {
        return next.run(request).await;
    }
    let Some(expected) = expected else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "api key enabled but not configured").into_response();
    };
    let supplied = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if supplied != expected {
        return (StatusCode::UNAUTHORIZED, "invalid or missing API key").into_response();
    }
    next.run(request).await
}
