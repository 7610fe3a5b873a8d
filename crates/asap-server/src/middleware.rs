// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the ASAP server: request ids, structured
//! request logging, and the global request-rate limit.

use asap_ratelimit::SlidingWindowLimiter;
use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Generate a [`RequestId`] per request and echo it as `X-Request-Id`.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

// ---------------------------------------------------------------------------
// Request logger
// ---------------------------------------------------------------------------

/// Log method, path, status, and duration with structured fields.
pub async fn request_logger_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

/// Global request-rate gate; runs before the `/asap` pipeline.
///
/// Denials answer 429 with a `Retry-After` hint derived from the window.
pub async fn rate_limit_middleware(
    State(limiter): State<SlidingWindowLimiter>,
    req: Request,
    next: Next,
) -> Response {
    if !limiter.check() {
        warn!(path = %req.uri().path(), "request rate limit exceeded");
        let retry_after = limiter.window().as_secs().max(1).to_string();
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", retry_after)],
            axum::Json(serde_json::json!({
                "error": "rate limit exceeded",
                "code": "asap:transport/rate_limited",
            })),
        )
            .into_response();
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// CORS
// ---------------------------------------------------------------------------

/// Configuration for CORS headers on the HTTP surface.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Origins allowed to call the API.
    pub allowed_origins: Vec<String>,
    /// Allowed HTTP methods.
    pub allowed_methods: Vec<String>,
    /// Allowed request headers.
    pub allowed_headers: Vec<String>,
}

impl CorsConfig {
    /// Convert this configuration into a [`tower_http::cors::CorsLayer`].
    #[must_use]
    pub fn to_cors_layer(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();

        let methods: Vec<axum::http::Method> = self
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();

        let headers: Vec<axum::http::HeaderName> = self
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::list(methods))
            .allow_headers(AllowHeaders::list(headers))
    }
}
