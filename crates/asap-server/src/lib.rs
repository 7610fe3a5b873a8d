// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-server
#![deny(unsafe_code)]
//!
//! HTTP and WebSocket server runtime for the ASAP protocol: the
//! JSON-RPC request pipeline, handler registry with a bounded blocking
//! executor, bearer authentication, manifest discovery, usage REST
//! surface, and per-connection WebSocket handling.

pub mod auth;
pub mod config;
pub mod handler;
pub mod middleware;
mod pipeline;
mod usage;
mod ws;

pub use auth::{AuthError, TokenValidator, blocking_token_validator, token_validator_fn};
pub use config::{ConfigError, MeteringBackend, ServerConfig};
pub use handler::{AsapHandler, HandlerError, HandlerRegistry, handler_fn};
pub use middleware::CorsConfig;
pub use ws::{
    WS_CLOSE_GOING_AWAY, WS_CLOSE_POLICY_VIOLATION, WS_CLOSE_REASON_SHUTDOWN, WsServerSettings,
};

use asap_core::Manifest;
use asap_metering::MeteringStore;
use asap_protocol::validate::{NonceStore, ValidationConfig};
use asap_ratelimit::SlidingWindowLimiter;
use asap_telemetry::MetricsCollector;
use axum::Router;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from assembling an [`AppState`].
#[derive(Debug, Error)]
pub enum ServerConfigError {
    /// The manifest fails its structural invariants.
    #[error("manifest invalid: {0}")]
    Manifest(#[from] asap_core::ManifestError),

    /// The manifest advertises bearer auth but no validator was given.
    #[error("manifest advertises bearer auth but no token validator was supplied")]
    TokenValidatorRequired,
}

/// Shared server state behind every route.
pub struct AppState {
    /// The serving agent's manifest.
    pub manifest: Manifest,
    /// Payload-type handler registry.
    pub handlers: Arc<HandlerRegistry>,
    /// Validation pipeline settings.
    pub validation: ValidationConfig,
    /// Replay-protection store.
    pub nonces: Arc<NonceStore>,
    /// Bearer-token validator, present when the manifest requires auth.
    pub token_validator: Option<Arc<dyn TokenValidator>>,
    /// Metering store; also gates mounting of the `/usage` surface.
    pub metering: Option<Arc<dyn MeteringStore>>,
    /// Request metrics sink.
    pub metrics: MetricsCollector,
    /// Global request limiter, applied before the pipeline.
    pub rate_limiter: Option<SlidingWindowLimiter>,
    /// Ceiling on request bodies, before and after decompression.
    pub max_request_size: usize,
    /// Response bodies at or above this size are compressed per
    /// `Accept-Encoding`.
    pub compression_threshold: usize,
    /// Include handler error detail in internal-error replies.
    pub debug: bool,
    /// CORS policy for browser callers, when configured.
    pub cors: Option<CorsConfig>,
    /// WebSocket heartbeat and rate settings.
    pub ws: WsServerSettings,
    pub(crate) ws_connections: ws::WsConnections,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Start building state around a manifest and handler registry.
    #[must_use]
    pub fn builder(manifest: Manifest, handlers: Arc<HandlerRegistry>) -> AppStateBuilder {
        AppStateBuilder {
            manifest,
            handlers,
            validation: ValidationConfig::default(),
            nonces: None,
            token_validator: None,
            metering: None,
            metrics: None,
            rate_limit: None,
            max_request_size: 10 * 1024 * 1024,
            compression_threshold: asap_protocol::COMPRESSION_THRESHOLD,
            debug: false,
            cors: None,
            ws: WsServerSettings::default(),
        }
    }

    /// Number of live WebSocket connections.
    #[must_use]
    pub fn active_websockets(&self) -> usize {
        self.ws_connections.active_count()
    }

    /// Push an `sla.breach` notification to every subscribed WebSocket
    /// connection; returns how many connections it was queued for.
    pub fn notify_sla_breach(&self, data: serde_json::Value) -> usize {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": "sla.breach",
            "params": data,
        });
        self.ws_connections.broadcast_sla(&frame.to_string())
    }

    /// Ask every active WebSocket connection to close with 1001
    /// (Going Away); part of graceful drain.
    pub fn shutdown_websockets(&self) {
        self.ws_connections.shutdown_all();
    }
}

/// Fluent constructor for [`AppState`].
pub struct AppStateBuilder {
    manifest: Manifest,
    handlers: Arc<HandlerRegistry>,
    validation: ValidationConfig,
    nonces: Option<Arc<NonceStore>>,
    token_validator: Option<Arc<dyn TokenValidator>>,
    metering: Option<Arc<dyn MeteringStore>>,
    metrics: Option<MetricsCollector>,
    rate_limit: Option<(u32, Duration)>,
    max_request_size: usize,
    compression_threshold: usize,
    debug: bool,
    cors: Option<CorsConfig>,
    ws: WsServerSettings,
}

impl AppStateBuilder {
    /// Override validation pipeline settings.
    #[must_use]
    pub fn validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }

    /// Use an explicit nonce store (defaults to a fresh store).
    #[must_use]
    pub fn nonce_store(mut self, nonces: Arc<NonceStore>) -> Self {
        self.nonces = Some(nonces);
        self
    }

    /// Supply the bearer-token validator.
    #[must_use]
    pub fn token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.token_validator = Some(validator);
        self
    }

    /// Attach a metering store; this also mounts the `/usage` surface.
    #[must_use]
    pub fn metering(mut self, store: Arc<dyn MeteringStore>) -> Self {
        self.metering = Some(store);
        self
    }

    /// Use an explicit metrics collector (defaults to the process-wide
    /// collector).
    #[must_use]
    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cap requests at `max_requests` per `window`.
    #[must_use]
    pub fn rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.rate_limit = Some((max_requests, window));
        self
    }

    /// Override the request body ceiling.
    #[must_use]
    pub fn max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }

    /// Override the response compression threshold.
    #[must_use]
    pub fn compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Include handler error detail in internal-error replies.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Allow browser callers from the given CORS policy.
    #[must_use]
    pub fn cors(mut self, cors: CorsConfig) -> Self {
        self.cors = Some(cors);
        self
    }

    /// Override WebSocket heartbeat / rate settings.
    #[must_use]
    pub fn ws_settings(mut self, ws: WsServerSettings) -> Self {
        self.ws = ws;
        self
    }

    /// Finalize, checking configuration invariants.
    ///
    /// # Errors
    ///
    /// [`ServerConfigError::Manifest`] for structural manifest problems;
    /// [`ServerConfigError::TokenValidatorRequired`] when the manifest
    /// advertises bearer auth without a validator.
    pub fn build(self) -> Result<Arc<AppState>, ServerConfigError> {
        self.manifest.validate()?;
        if self.manifest.requires_bearer_auth() && self.token_validator.is_none() {
            return Err(ServerConfigError::TokenValidatorRequired);
        }
        Ok(Arc::new(AppState {
            manifest: self.manifest,
            handlers: self.handlers,
            validation: self.validation,
            nonces: self.nonces.unwrap_or_default(),
            token_validator: self.token_validator,
            metering: self.metering,
            metrics: self.metrics.unwrap_or_else(|| asap_telemetry::global().clone()),
            rate_limiter: self
                .rate_limit
                .map(|(max, window)| SlidingWindowLimiter::new(max, window)),
            max_request_size: self.max_request_size,
            compression_threshold: self.compression_threshold,
            debug: self.debug,
            cors: self.cors,
            ws: self.ws,
            ws_connections: ws::WsConnections::default(),
        }))
    }
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> Response {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_text(),
    )
        .into_response()
}

async fn manifest_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let body = match serde_json::to_vec(&state.manifest) {
        Ok(body) => body,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": format!("manifest encode failed: {err}") })),
            )
                .into_response();
        }
    };
    let digest = Sha256::digest(&body);
    let mut etag = String::with_capacity(66);
    etag.push('"');
    for byte in digest {
        etag.push_str(&format!("{byte:02x}"));
    }
    etag.push('"');

    let matched = headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|value| value.split(',').any(|candidate| candidate.trim() == etag));
    if matched {
        return (
            StatusCode::NOT_MODIFIED,
            [
                (ETAG, etag),
                (CACHE_CONTROL, "public, max-age=300".to_string()),
            ],
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/json".to_string()),
            (ETAG, etag),
            (CACHE_CONTROL, "public, max-age=300".to_string()),
        ],
        body,
    )
        .into_response()
}

/// Build the Axum router with every server route.
///
/// The `/usage` surface is mounted only when a metering store is
/// configured; the limiter (when configured) runs before the pipeline,
/// inside request-id and logging middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/asap", post(pipeline::handle_asap))
        .route("/.well-known/asap/manifest.json", get(manifest_endpoint))
        .route("/health", get(health))
        .route("/ready", get(health))
        .route("/asap/metrics", get(metrics_endpoint))
        .route("/asap/ws", get(ws::ws_endpoint));
    if state.metering.is_some() {
        router = router.merge(usage::usage_router());
    }

    let mut app = router.with_state(state.clone());
    if let Some(limiter) = &state.rate_limiter {
        app = app.layer(axum::middleware::from_fn_with_state(
            limiter.clone(),
            middleware::rate_limit_middleware,
        ));
    }
    if let Some(cors) = &state.cors {
        app = app.layer(cors.to_cors_layer());
    }
    app.layer(axum::middleware::from_fn(middleware::request_logger_middleware))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
}
