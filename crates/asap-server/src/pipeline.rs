// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `/asap` request pipeline: size gate, decompression, JSON and
//! JSON-RPC parsing, envelope extraction, authentication, validation,
//! dispatch, and response encoding.

use crate::AppState;
use crate::auth::authenticate;
use crate::handler::HandlerError;
use asap_metering::record_task_usage;
use asap_protocol::jsonrpc::{JsonRpcResponse, error_codes};
use asap_protocol::validate::{ValidationError, validate_envelope};
use asap_protocol::{CompressError, CompressionAlgorithm, decompress, encode};
use asap_telemetry::{bounded_label, labels};
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Non-JSON-RPC failure replies carry a stable machine-readable code.
fn transport_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        axum::Json(json!({ "error": message, "code": code })),
    )
        .into_response()
}

/// Outcome of processing one JSON-RPC frame, shared between the HTTP
/// and WebSocket transports.
pub(crate) enum Processed {
    /// Normal JSON-RPC reply (success or error) on HTTP 200.
    Rpc(JsonRpcResponse),
    /// Sender mismatch: HTTP 403 with the JSON-RPC body.
    Forbidden(JsonRpcResponse),
    /// Blocking worker pool exhausted: HTTP 503 with a structured body.
    PoolExhausted {
        max_threads: usize,
        active_threads: usize,
    },
}

/// Steps 3–10 of the pipeline, operating on an already-decoded frame.
/// Authentication (step 6) runs after envelope extraction so auth
/// failures echo the request id in a normal JSON-RPC error reply.
pub(crate) async fn process_frame(
    state: &AppState,
    frame: Value,
    headers: &HeaderMap,
) -> Processed {
    let Value::Object(ref fields) = frame else {
        return Processed::Rpc(JsonRpcResponse::error(
            error_codes::INVALID_REQUEST,
            "Invalid request: body must be a JSON object",
            None,
            Value::Null,
        ));
    };
    let id = fields.get("id").cloned().unwrap_or(Value::Null);

    match fields.get("method").and_then(Value::as_str) {
        Some(asap_protocol::ASAP_METHOD) => {}
        other => {
            return Processed::Rpc(JsonRpcResponse::error(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", other.unwrap_or("<missing>")),
                None,
                id,
            ));
        }
    }

    let Some(params) = fields.get("params").and_then(Value::as_object) else {
        return Processed::Rpc(JsonRpcResponse::error(
            error_codes::INVALID_PARAMS,
            "Invalid params: params must be an object",
            None,
            id,
        ));
    };

    let Some(envelope_value) = params.get("envelope").filter(|v| v.is_object()) else {
        return Processed::Rpc(JsonRpcResponse::error(
            error_codes::INVALID_PARAMS,
            "Invalid params: missing envelope object",
            None,
            id,
        ));
    };

    let envelope: asap_core::Envelope = match serde_json::from_value(envelope_value.clone()) {
        Ok(envelope) => envelope,
        Err(err) => {
            return Processed::Rpc(JsonRpcResponse::error(
                error_codes::INVALID_PARAMS,
                "Invalid params: envelope failed validation",
                Some(json!({ "validation_errors": [err.to_string()] })),
                id,
            ));
        }
    };

    let authenticated = match authenticate(state.token_validator.as_ref(), headers).await {
        Ok(authenticated) => authenticated,
        Err(err) => {
            let message = err.to_string();
            return Processed::Rpc(JsonRpcResponse::error(
                error_codes::INVALID_REQUEST,
                message.clone(),
                Some(json!({ "error": message })),
                id,
            ));
        }
    };

    if let Err(err) = validate_envelope(
        &envelope,
        &state.validation,
        &state.nonces,
        authenticated.as_ref(),
        Utc::now(),
    ) {
        let response = JsonRpcResponse::error(err.code(), err.to_string(), None, id);
        return if matches!(err, ValidationError::SenderMismatch { .. }) {
            warn!(envelope_id = envelope.id(), error = %err, "sender mismatch");
            Processed::Forbidden(response)
        } else {
            debug!(envelope_id = envelope.id(), error = %err, "envelope rejected");
            Processed::Rpc(response)
        };
    }

    let known = state.handlers.known_payload_types();
    let known_refs: Vec<&str> = known.iter().map(String::as_str).collect();
    let payload_label = bounded_label(envelope.payload_type(), &known_refs).to_string();

    let started = Instant::now();
    let result = state
        .handlers
        .dispatch(envelope.clone(), state.manifest.clone())
        .await;
    let duration = started.elapsed();

    match result {
        Ok(reply) => {
            if let Some(store) = &state.metering {
                if let Err(err) = record_task_usage(
                    store.as_ref(),
                    &envelope,
                    &reply,
                    duration.as_millis() as i64,
                    &state.manifest,
                )
                .await
                {
                    warn!(error = %err, "usage recording failed");
                }
            }
            state.metrics.increment_counter(
                "asap_server_requests_total",
                labels(&[("payload_type", &payload_label), ("status", "success")]),
            );
            state.metrics.observe_histogram(
                "asap_server_request_duration_seconds",
                duration.as_secs_f64(),
                labels(&[("payload_type", &payload_label)]),
            );
            Processed::Rpc(JsonRpcResponse::success(&reply, id))
        }
        Err(HandlerError::NotFound { payload_type }) => {
            state.metrics.increment_counter(
                "asap_server_requests_total",
                labels(&[("payload_type", "other"), ("status", "error")]),
            );
            Processed::Rpc(JsonRpcResponse::error(
                error_codes::METHOD_NOT_FOUND,
                format!("No handler for payload type {payload_type:?}"),
                Some(json!({ "payload_type": payload_type })),
                id,
            ))
        }
        Err(HandlerError::PoolExhausted {
            max_threads,
            active_threads,
        }) => {
            state.metrics.increment_counter(
                "asap_server_requests_total",
                labels(&[("payload_type", &payload_label), ("status", "error")]),
            );
            Processed::PoolExhausted {
                max_threads,
                active_threads,
            }
        }
        Err(HandlerError::Failed(message)) => {
            warn!(envelope_id = envelope.id(), error = %message, "handler failed");
            state.metrics.increment_counter(
                "asap_server_requests_total",
                labels(&[("payload_type", &payload_label), ("status", "error")]),
            );
            let data = state.debug.then(|| json!({ "error": message }));
            Processed::Rpc(JsonRpcResponse::error(
                error_codes::INTERNAL_ERROR,
                "Internal error",
                data,
                id,
            ))
        }
    }
}

fn declared_content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Pick the response coding from the client's `Accept-Encoding`.
fn response_algorithm(headers: &HeaderMap) -> CompressionAlgorithm {
    let accepted = headers
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    #[cfg(feature = "brotli")]
    if accepted.contains("br") {
        return CompressionAlgorithm::Brotli;
    }
    if accepted.contains("gzip") {
        CompressionAlgorithm::Gzip
    } else {
        CompressionAlgorithm::Identity
    }
}

fn rpc_response(state: &AppState, headers: &HeaderMap, status: StatusCode, reply: &JsonRpcResponse) -> Response {
    let body = match serde_json::to_vec(reply) {
        Ok(body) => body,
        Err(err) => {
            return transport_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "asap:transport/encode_failed",
                &format!("failed to encode response: {err}"),
            );
        }
    };

    let algorithm = response_algorithm(headers);
    if algorithm != CompressionAlgorithm::Identity && body.len() >= state.compression_threshold {
        if let Ok(compressed) = encode(algorithm, &body) {
            return (
                status,
                [
                    (CONTENT_TYPE, "application/json"),
                    (CONTENT_ENCODING, algorithm.content_encoding()),
                ],
                compressed,
            )
                .into_response();
        }
    }
    (status, [(CONTENT_TYPE, "application/json")], body).into_response()
}

/// POST `/asap` entry point.
pub(crate) async fn handle_asap(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let headers = parts.headers;

    // 1. Size gate: refuse on the declared length before reading, then
    //    enforce the same ceiling on the accumulated bytes.
    if let Some(declared) = declared_content_length(&headers) {
        if declared > state.max_request_size {
            return transport_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "asap:transport/request_too_large",
                &format!("request body exceeds {} bytes", state.max_request_size),
            );
        }
    }
    let raw: Bytes = match axum::body::to_bytes(body, state.max_request_size).await {
        Ok(raw) => raw,
        Err(_) => {
            return transport_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "asap:transport/request_too_large",
                &format!("request body exceeds {} bytes", state.max_request_size),
            );
        }
    };

    // 2. Decode Content-Encoding, enforcing the decompressed ceiling.
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(algorithm) = CompressionAlgorithm::from_content_encoding(encoding) else {
        return transport_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "asap:transport/unsupported_encoding",
            &format!("unsupported content encoding {encoding:?}"),
        );
    };
    let decoded = match decompress(algorithm, &raw, state.max_request_size) {
        Ok(decoded) => decoded,
        Err(CompressError::TooLarge { limit }) => {
            return transport_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "asap:transport/request_too_large",
                &format!("decompressed body exceeds {limit} bytes"),
            );
        }
        Err(err) => {
            return transport_error(
                StatusCode::BAD_REQUEST,
                "asap:transport/invalid_body",
                &format!("failed to decode request body: {err}"),
            );
        }
    };

    // 3. Parse JSON; unrecoverable ids answer with id null.
    let frame: Value = match serde_json::from_slice(&decoded) {
        Ok(frame) => frame,
        Err(err) => {
            return rpc_response(
                &state,
                &headers,
                StatusCode::OK,
                &JsonRpcResponse::error(
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {err}"),
                    None,
                    Value::Null,
                ),
            );
        }
    };

    match process_frame(&state, frame, &headers).await {
        Processed::Rpc(reply) => rpc_response(&state, &headers, StatusCode::OK, &reply),
        Processed::Forbidden(reply) => {
            rpc_response(&state, &headers, StatusCode::FORBIDDEN, &reply)
        }
        Processed::PoolExhausted {
            max_threads,
            active_threads,
        } => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "error": "handler worker pool exhausted",
                "code": "asap:transport/thread_pool_exhausted",
                "details": { "max_threads": max_threads, "active_threads": active_threads },
            })),
        )
            .into_response(),
    }
}
