// SPDX-License-Identifier: MIT OR Apache-2.0
//! The ASAP HTTP client.

use crate::cache::{DEFAULT_MANIFEST_TTL, ManifestCache};
use crate::error::{ClientConfigError, ClientError};
use crate::sanitize::sanitize_url;
use asap_core::{Envelope, Manifest, generate_id};
use asap_protocol::jsonrpc::{self, JsonRpcRequest};
use asap_protocol::{CompressionAlgorithm, accept_encoding_header, compress_payload, decompress};
use asap_retry::{CircuitBreaker, CircuitOpenError, RetryPolicy, parse_retry_after, registry};
use asap_telemetry::labels;
use chrono::Utc;
use reqwest::Url;
use reqwest::header::{CONTENT_ENCODING, RETRY_AFTER};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default cap on idle pooled connections per host.
pub const DEFAULT_POOL_MAX_IDLE: usize = 100;
/// Default idle expiry for pooled connections.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Default deadline for establishing a new connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Ceiling for manifest fetches regardless of the request timeout.
pub const MANIFEST_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Ceiling on decompressed response bodies.
pub const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// Client construction parameters.
///
/// The connection pool and HTTP/2 negotiation live in the underlying
/// transport; the client only configures limits. HTTP/2 is negotiated
/// via ALPN on HTTPS endpoints with automatic HTTP/1.1 fallback; set
/// `http2_prior_knowledge` for cleartext HTTP/2 servers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request deadline.
    pub timeout: Duration,
    /// Deadline for establishing a connection (pool acquisition included).
    pub connect_timeout: Duration,
    /// Max idle pooled connections per host.
    pub pool_max_idle: usize,
    /// Idle expiry for pooled connections.
    pub pool_idle_timeout: Duration,
    /// Speak HTTP/2 without ALPN negotiation.
    pub http2_prior_knowledge: bool,
    /// Reject plain HTTP for non-loopback hosts.
    pub require_https: bool,
    /// Compress request bodies that reach the threshold.
    pub compression: bool,
    /// Bodies at or above this size are compressed.
    pub compression_threshold: usize,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
    /// Share a circuit breaker for this endpoint.
    pub circuit_breaker_enabled: bool,
    /// Consecutive failures before the breaker opens.
    pub circuit_breaker_threshold: u32,
    /// Cooldown before an open breaker admits a probe.
    pub circuit_breaker_timeout: Duration,
    /// TTL for the per-client manifest cache.
    pub manifest_cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_max_idle: DEFAULT_POOL_MAX_IDLE,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            http2_prior_knowledge: false,
            require_https: true,
            compression: true,
            compression_threshold: asap_protocol::COMPRESSION_THRESHOLD,
            retry: RetryPolicy::default(),
            circuit_breaker_enabled: false,
            circuit_breaker_threshold: asap_retry::DEFAULT_BREAKER_THRESHOLD,
            circuit_breaker_timeout: Duration::from_secs_f64(
                asap_retry::DEFAULT_BREAKER_TIMEOUT_SECS,
            ),
            manifest_cache_ttl: DEFAULT_MANIFEST_TTL,
        }
    }
}

/// Async HTTP client for envelope exchange with one remote agent.
///
/// Dropping the client releases the pooled transport.
///
/// # Examples
///
/// ```no_run
/// # async fn demo(envelope: asap_core::Envelope) -> Result<(), Box<dyn std::error::Error>> {
/// use asap_client::AsapClient;
///
/// let client = AsapClient::new("http://localhost:8000")?;
/// let response = client.send(&envelope).await?;
/// println!("{}", response.payload_type());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AsapClient {
    base_url: String,
    sanitized_url: String,
    http: reqwest::Client,
    config: ClientConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    manifest_cache: ManifestCache,
    request_counter: AtomicU64,
}

impl AsapClient {
    /// Client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`AsapClient::with_config`].
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientConfigError> {
        Self::with_config(base_url, ClientConfig::default())
    }

    /// Client with explicit configuration.
    ///
    /// Enforces the URL policy: only `http` / `https` schemes, and plain
    /// HTTP only for loopback hosts while `require_https` is set
    /// (loopback HTTP logs a warning instead).
    ///
    /// # Errors
    ///
    /// Returns [`ClientConfigError`] for URL policy violations or when
    /// the transport cannot be built.
    pub fn with_config(
        base_url: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, ClientConfigError> {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        let sanitized = sanitize_url(&base_url);

        let parsed = Url::parse(&base_url).map_err(|_| ClientConfigError::InvalidUrl {
            url: sanitized.clone(),
        })?;
        let scheme = parsed.scheme().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(ClientConfigError::UnsupportedScheme {
                scheme,
                url: sanitized,
            });
        }
        if config.require_https && scheme == "http" {
            if is_loopback_host(&parsed) {
                warn!(
                    url = %sanitized,
                    "using HTTP for a loopback connection; use HTTPS in production \
                     or disable require_https to silence this warning"
                );
            } else {
                return Err(ClientConfigError::HttpsRequired { url: sanitized });
            }
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle)
            .pool_idle_timeout(config.pool_idle_timeout);
        if config.http2_prior_knowledge {
            builder = builder.http2_prior_knowledge();
        }
        let http = builder.build().map_err(ClientConfigError::Transport)?;

        // The registry keys breakers on the sanitized base URL so clients
        // for the same endpoint share failure state.
        let breaker = config.circuit_breaker_enabled.then(|| {
            registry().get_or_create(
                &sanitized,
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout,
            )
        });

        Ok(Self {
            base_url,
            sanitized_url: sanitized,
            http,
            manifest_cache: ManifestCache::new(config.manifest_cache_ttl),
            config,
            breaker,
            request_counter: AtomicU64::new(0),
        })
    }

    /// The endpoint base URL (trailing slash trimmed).
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one envelope and await the correlated response envelope.
    ///
    /// Performs up to `retry.max_retries` attempts with exponential
    /// backoff for 5xx, 429, connect errors, and timeouts. A single
    /// idempotency key is generated per logical send and repeated on
    /// every attempt, both in `params` and the `X-Idempotency-Key`
    /// header.
    ///
    /// # Errors
    ///
    /// [`ClientError::CircuitOpen`] without a network call when the
    /// breaker is open; otherwise the mapped transport or remote error
    /// after retries are exhausted.
    pub async fn send(&self, envelope: &Envelope) -> Result<Envelope, ClientError> {
        if let Some(breaker) = &self.breaker {
            if !breaker.can_attempt() {
                return Err(CircuitOpenError {
                    base_url: self.sanitized_url.clone(),
                    consecutive_failures: breaker.consecutive_failures(),
                }
                .into());
            }
        }

        let started = Instant::now();
        let idempotency_key = generate_id();
        let request_id = format!("req-{}", self.request_counter.fetch_add(1, Ordering::Relaxed) + 1);

        info!(
            target_url = %self.sanitized_url,
            envelope_id = envelope.id(),
            trace_id = envelope.trace_id().unwrap_or(""),
            payload_type = envelope.payload_type(),
            idempotency_key = %idempotency_key,
            "sending envelope"
        );

        let frame = JsonRpcRequest::send_envelope(
            envelope,
            Some(&idempotency_key),
            Value::String(request_id),
        );
        let serialized = serde_json::to_vec(&frame).map_err(|e| ClientError::Connection {
            url: self.sanitized_url.clone(),
            message: format!("failed to serialize request: {e}"),
        })?;

        let (body, content_encoding) = if self.config.compression {
            let (bytes, algorithm) =
                compress_payload(&serialized, self.config.compression_threshold).map_err(|e| {
                    ClientError::Connection {
                        url: self.sanitized_url.clone(),
                        message: format!("failed to compress request: {e}"),
                    }
                })?;
            match algorithm {
                CompressionAlgorithm::Identity => (bytes, None),
                other => {
                    debug!(
                        algorithm = other.content_encoding(),
                        original_size = serialized.len(),
                        compressed_size = bytes.len(),
                        "request body compressed"
                    );
                    (bytes, Some(other.content_encoding()))
                }
            }
        } else {
            (serialized, None)
        };

        let mut last_error: Option<ClientError> = None;
        for attempt in 0..self.config.retry.max_retries {
            if attempt > 0 {
                asap_telemetry::global().increment_counter("asap_transport_retries_total", labels(&[]));
            }

            let mut request = self
                .http
                .post(format!("{}/asap", self.base_url))
                .header("Content-Type", "application/json")
                .header("X-Idempotency-Key", &idempotency_key)
                .header("Accept-Encoding", accept_encoding_header())
                .body(body.clone());
            if let Some(encoding) = content_encoding {
                request = request.header("Content-Encoding", encoding);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    let error = self.map_transport_error(&err);
                    if attempt + 1 < self.config.retry.max_retries {
                        let delay = self.config.retry.backoff_delay(attempt);
                        warn!(
                            target_url = %self.sanitized_url,
                            envelope_id = envelope.id(),
                            attempt = attempt + 1,
                            max_retries = self.config.retry.max_retries,
                            delay_secs = delay.as_secs_f64(),
                            error = %error,
                            "transport error; retrying"
                        );
                        last_error = Some(error);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    self.record_failure();
                    self.emit_error_metrics(started, "transport");
                    return Err(error);
                }
            };

            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                let is_rate_limit = status.as_u16() == 429;
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let snippet = body_snippet(response).await;
                let error = ClientError::Connection {
                    url: self.sanitized_url.clone(),
                    message: format!("HTTP {} from server: {snippet}", status.as_u16()),
                };
                if attempt + 1 < self.config.retry.max_retries {
                    let delay = if is_rate_limit {
                        retry_after
                            .as_deref()
                            .and_then(|value| parse_retry_after(value, Utc::now()))
                            .unwrap_or_else(|| self.config.retry.backoff_delay(attempt))
                    } else {
                        self.config.retry.backoff_delay(attempt)
                    };
                    warn!(
                        target_url = %self.sanitized_url,
                        status = status.as_u16(),
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        "retriable HTTP status; backing off"
                    );
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                self.record_failure();
                self.emit_error_metrics(started, "http_status");
                return Err(error);
            }

            if status.is_client_error() {
                // Persistent 4xx (401/403 and friends) indicates unhealthy
                // configuration; it counts against the breaker and is not
                // retried.
                let snippet = body_snippet(response).await;
                self.record_failure();
                self.emit_error_metrics(started, "http_status");
                return Err(ClientError::Connection {
                    url: self.sanitized_url.clone(),
                    message: format!("HTTP client error {} from server: {snippet}", status.as_u16()),
                });
            }

            let frame = self.read_json_frame(response).await?;
            return self.finish_send(envelope, &frame, started, attempt);
        }

        self.record_failure();
        self.emit_error_metrics(started, "retries_exhausted");
        Err(last_error.unwrap_or_else(|| ClientError::Connection {
            url: self.sanitized_url.clone(),
            message: format!("max retries ({}) exceeded", self.config.retry.max_retries),
        }))
    }

    /// Send many envelopes concurrently over the shared pool, failing
    /// fast on the first error. Results preserve input order.
    ///
    /// # Errors
    ///
    /// The first failed send's error.
    pub async fn send_batch(&self, envelopes: &[Envelope]) -> Result<Vec<Envelope>, ClientError> {
        let settled = self.send_batch_settled(envelopes).await;
        settled.into_iter().collect()
    }

    /// Send many envelopes concurrently, keeping per-slot outcomes.
    ///
    /// Failed slots hold the error instead of an envelope; order matches
    /// the input.
    pub async fn send_batch_settled(
        &self,
        envelopes: &[Envelope],
    ) -> Vec<Result<Envelope, ClientError>> {
        let batch_size = envelopes.len();
        info!(
            target_url = %self.sanitized_url,
            batch_size,
            "sending envelope batch"
        );
        let started = Instant::now();

        let results =
            futures::future::join_all(envelopes.iter().map(|envelope| self.send(envelope))).await;

        let success_count = results.iter().filter(|r| r.is_ok()).count();
        let failure_count = batch_size - success_count;
        let duration = started.elapsed();
        let metrics = asap_telemetry::global();
        metrics.increment_counter("asap_transport_batch_total", labels(&[]));
        metrics.add_to_counter(
            "asap_transport_batch_envelopes_total",
            labels(&[("status", "success")]),
            success_count as u64,
        );
        metrics.add_to_counter(
            "asap_transport_batch_envelopes_total",
            labels(&[("status", "error")]),
            failure_count as u64,
        );
        metrics.observe_histogram(
            "asap_transport_batch_duration_seconds",
            duration.as_secs_f64(),
            labels(&[]),
        );
        info!(
            target_url = %self.sanitized_url,
            batch_size,
            success_count,
            failure_count,
            duration_ms = duration.as_millis() as u64,
            throughput_per_second = if duration.as_secs_f64() > 0.0 {
                batch_size as f64 / duration.as_secs_f64()
            } else {
                0.0
            },
            "envelope batch complete"
        );
        results
    }

    /// Fetch the remote agent's manifest, honoring the per-client cache.
    ///
    /// Defaults to `{base_url}/.well-known/asap/manifest.json`. Any HTTP,
    /// parse, or validation error invalidates the cache entry first.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] / [`ClientError::Timeout`] for
    /// transport failures, [`ClientError::InvalidManifest`] for bodies
    /// that do not validate.
    pub async fn get_manifest(&self, url: Option<&str>) -> Result<Manifest, ClientError> {
        let url = url
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}{}", self.base_url, asap_core::manifest::MANIFEST_PATH));
        let sanitized = sanitize_url(&url);

        if let Some(cached) = self.manifest_cache.get(&url) {
            debug!(url = %sanitized, "manifest cache hit");
            return Ok(cached);
        }
        debug!(url = %sanitized, "manifest cache miss; fetching");

        let response = self
            .http
            .get(&url)
            .timeout(self.config.timeout.min(MANIFEST_REQUEST_TIMEOUT))
            .send()
            .await
            .map_err(|err| {
                self.manifest_cache.invalidate(&url);
                if err.is_timeout() {
                    ClientError::Timeout {
                        timeout: self.config.timeout.min(MANIFEST_REQUEST_TIMEOUT),
                    }
                } else {
                    ClientError::Connection {
                        url: sanitized.clone(),
                        message: format!("manifest request failed: {err}"),
                    }
                }
            })?;

        if response.status().as_u16() >= 400 {
            self.manifest_cache.invalidate(&url);
            let status = response.status().as_u16();
            let snippet = body_snippet(response).await;
            return Err(ClientError::Connection {
                url: sanitized,
                message: format!("HTTP {status} fetching manifest: {snippet}"),
            });
        }

        let manifest: Manifest = match response.json().await {
            Ok(manifest) => manifest,
            Err(err) => {
                self.manifest_cache.invalidate(&url);
                return Err(ClientError::InvalidManifest {
                    url: sanitized,
                    message: err.to_string(),
                });
            }
        };
        if let Err(err) = manifest.validate() {
            self.manifest_cache.invalidate(&url);
            return Err(ClientError::InvalidManifest {
                url: sanitized,
                message: err.to_string(),
            });
        }

        self.manifest_cache.set(&url, manifest.clone());
        info!(url = %sanitized, manifest_id = %manifest.id, "manifest fetched and cached");
        Ok(manifest)
    }

    fn map_transport_error(&self, err: &reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout {
                timeout: self.config.timeout,
            }
        } else {
            ClientError::Connection {
                url: self.sanitized_url.clone(),
                message: err.to_string(),
            }
        }
    }

    async fn read_json_frame(&self, response: reqwest::Response) -> Result<Value, ClientError> {
        let encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let algorithm = CompressionAlgorithm::from_content_encoding(&encoding).ok_or_else(|| {
            ClientError::Connection {
                url: self.sanitized_url.clone(),
                message: format!("unsupported response encoding {encoding:?}"),
            }
        })?;
        let bytes = response.bytes().await.map_err(|err| self.map_transport_error(&err))?;
        let decoded = decompress(algorithm, &bytes, MAX_RESPONSE_SIZE).map_err(|err| {
            ClientError::Connection {
                url: self.sanitized_url.clone(),
                message: format!("failed to decode response body: {err}"),
            }
        })?;
        serde_json::from_slice(&decoded).map_err(|err| ClientError::Remote {
            code: jsonrpc::error_codes::PARSE_ERROR,
            message: format!("invalid JSON response: {err}"),
            data: None,
        })
    }

    fn finish_send(
        &self,
        envelope: &Envelope,
        frame: &Value,
        started: Instant,
        attempt: u32,
    ) -> Result<Envelope, ClientError> {
        match jsonrpc::decode_response_envelope(frame) {
            Ok(response_envelope) => {
                self.record_success();
                let duration = started.elapsed();
                let metrics = asap_telemetry::global();
                metrics.increment_counter(
                    "asap_transport_send_total",
                    labels(&[("status", "success")]),
                );
                metrics.observe_histogram(
                    "asap_transport_send_duration_seconds",
                    duration.as_secs_f64(),
                    labels(&[("status", "success")]),
                );
                info!(
                    target_url = %self.sanitized_url,
                    envelope_id = envelope.id(),
                    response_id = response_envelope.id(),
                    duration_ms = duration.as_millis() as u64,
                    attempts = attempt + 1,
                    "envelope exchange complete"
                );
                Ok(response_envelope)
            }
            Err(jsonrpc::ResponseDecodeError::Remote { code, message, data }) => {
                // The transport round-trip worked; an application error is
                // a breaker success.
                self.record_success();
                self.emit_error_metrics(started, "remote");
                Err(ClientError::Remote { code, message, data })
            }
            Err(jsonrpc::ResponseDecodeError::MissingEnvelope) => {
                self.emit_error_metrics(started, "missing_envelope");
                Err(ClientError::Remote {
                    code: jsonrpc::error_codes::INTERNAL_ERROR,
                    message: "missing envelope in response".into(),
                    data: None,
                })
            }
            Err(jsonrpc::ResponseDecodeError::BadEnvelope(err)) => {
                self.emit_error_metrics(started, "bad_envelope");
                Err(ClientError::Remote {
                    code: jsonrpc::error_codes::INTERNAL_ERROR,
                    message: format!("invalid envelope in response: {err}"),
                    data: None,
                })
            }
        }
    }

    fn record_success(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.record_success();
        }
    }

    fn record_failure(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.record_failure();
        }
    }

    fn emit_error_metrics(&self, started: Instant, reason: &str) {
        let metrics = asap_telemetry::global();
        metrics.increment_counter("asap_transport_send_total", labels(&[("status", "error")]));
        metrics.increment_counter(
            "asap_transport_send_errors_total",
            labels(&[("reason", reason)]),
        );
        metrics.observe_histogram(
            "asap_transport_send_duration_seconds",
            started.elapsed().as_secs_f64(),
            labels(&[("status", "error")]),
        );
    }
}

fn is_loopback_host(url: &Url) -> bool {
    matches!(
        url.host_str().map(str::to_ascii_lowercase).as_deref(),
        Some("localhost" | "127.0.0.1" | "::1" | "[::1]")
    )
}

async fn body_snippet(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(text) => text.chars().take(200).collect(),
        Err(_) => String::from("<unreadable body>"),
    }
}
