// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON-RPC 2.0 framing for envelopes.
//!
//! One request wraps one envelope under `params.envelope` with an
//! optional `params.idempotency_key`; one response carries
//! `result.envelope` or an `error` object. The `id` is an opaque
//! [`serde_json::Value`] echoed byte-for-byte, `null` when a parse error
//! made the request id unrecoverable.

use asap_core::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// The JSON-RPC version tag on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name for envelope exchange.
pub const ASAP_METHOD: &str = "asap.send";

/// Notification method for server-pushed acknowledgements.
pub const ASAP_ACK_METHOD: &str = "asap.ack";

/// Well-known JSON-RPC error codes used by the runtime.
pub mod error_codes {
    /// Body is not valid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Shape violation (non-object body, sender mismatch).
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown `method`, or unknown `payload_type`.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Envelope validation failure (schema, timestamp, nonce).
    pub const INVALID_PARAMS: i64 = -32602;
    /// Handler exception or malformed result.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Per-connection WebSocket rate limit exceeded.
    pub const RATE_LIMITED: i64 = -32001;
}

/// A JSON-RPC 2.0 request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name, `asap.send` for envelope exchange.
    pub method: String,
    /// Parameters object.
    #[serde(default)]
    pub params: Value,
    /// Request id echoed in the response.
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcRequest {
    /// Build a request frame.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Wrap an envelope as an `asap.send` request.
    ///
    /// The idempotency key, when present, rides inside `params` next to
    /// the envelope so retried sends are byte-identical.
    #[must_use]
    pub fn send_envelope(envelope: &Envelope, idempotency_key: Option<&str>, id: Value) -> Self {
        let mut params = json!({ "envelope": envelope });
        if let Some(key) = idempotency_key {
            params["idempotency_key"] = Value::String(key.to_string());
        }
        Self::new(ASAP_METHOD, params, id)
    }

    /// Wrap an envelope as an `asap.ack` notification (no response id).
    #[must_use]
    pub fn ack_notification(envelope: &Envelope) -> Self {
        Self::new(ASAP_ACK_METHOD, json!({ "envelope": envelope }), Value::Null)
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code; see [`error_codes`].
    pub code: i64,
    /// One-line human-readable message.
    pub message: String,
    /// Structured detail, e.g. `validation_errors` or `payload_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 response frame (`result` or `error`, never both).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Success payload, `{ "envelope": ... }` for `asap.send`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Echo of the request id; `null` when the request id was unparseable.
    pub id: Value,
}

impl JsonRpcResponse {
    /// Success response carrying a reply envelope.
    #[must_use]
    pub fn success(envelope: &Envelope, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(json!({ "envelope": envelope })),
            error: None,
            id,
        }
    }

    /// Error response with the given code and message.
    #[must_use]
    pub fn error(code: i64, message: impl Into<String>, data: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }
}

/// Errors from decoding a response frame into an envelope.
#[derive(Debug, Error)]
pub enum ResponseDecodeError {
    /// The frame carried an `error` object.
    #[error("remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Remote error message.
        message: String,
        /// Structured remote detail.
        data: Option<Value>,
    },

    /// The frame had no `result.envelope`.
    #[error("missing envelope in response")]
    MissingEnvelope,

    /// `result.envelope` did not deserialize as an envelope.
    #[error("invalid envelope in response: {0}")]
    BadEnvelope(#[source] serde_json::Error),
}

/// Strictly decode a response frame: an `error` member wins, then
/// `result.envelope` must be present and well-formed.
///
/// # Errors
///
/// See [`ResponseDecodeError`]; parse failures here are never retried by
/// callers.
pub fn decode_response_envelope(frame: &Value) -> Result<Envelope, ResponseDecodeError> {
    if let Some(error) = frame.get("error") {
        return Err(ResponseDecodeError::Remote {
            code: error
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(error_codes::INTERNAL_ERROR),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
            data: error.get("data").cloned(),
        });
    }
    let envelope = frame
        .get("result")
        .and_then(|result| result.get("envelope"))
        .ok_or(ResponseDecodeError::MissingEnvelope)?;
    serde_json::from_value(envelope.clone()).map_err(ResponseDecodeError::BadEnvelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asap_core::AgentUrn;

    fn sample_envelope() -> Envelope {
        Envelope::builder()
            .sender(AgentUrn::parse("urn:asap:agent:a").unwrap())
            .recipient(AgentUrn::parse("urn:asap:agent:b").unwrap())
            .payload_type("task.request")
            .payload_json(json!({"conversation_id": "c", "skill_id": "s", "input": {}}))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn request_frame_shape() {
        let env = sample_envelope();
        let req = JsonRpcRequest::send_envelope(&env, Some("key-1"), json!("req-1"));
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["method"], "asap.send");
        assert_eq!(v["id"], "req-1");
        assert_eq!(v["params"]["idempotency_key"], "key-1");
        assert_eq!(v["params"]["envelope"]["id"], env.id());
    }

    #[test]
    fn request_without_idempotency_key_omits_it() {
        let env = sample_envelope();
        let req = JsonRpcRequest::send_envelope(&env, None, json!(1));
        let v = serde_json::to_value(&req).unwrap();
        assert!(v["params"].get("idempotency_key").is_none());
    }

    #[test]
    fn success_response_roundtrips_envelope() {
        let env = sample_envelope();
        let resp = JsonRpcResponse::success(&env, json!("req-9"));
        let frame = serde_json::to_value(&resp).unwrap();
        assert_eq!(frame["id"], "req-9");
        let decoded = decode_response_envelope(&frame).unwrap();
        assert_eq!(decoded.id(), env.id());
    }

    #[test]
    fn error_member_wins_over_result() {
        let frame = json!({
            "jsonrpc": "2.0",
            "error": {"code": -32601, "message": "Method not found", "data": {"payload_type": "x"}},
            "result": {"envelope": {}},
            "id": 4,
        });
        match decode_response_envelope(&frame).unwrap_err() {
            ResponseDecodeError::Remote { code, message, data } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
                assert_eq!(data.unwrap()["payload_type"], "x");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[test]
    fn missing_envelope_is_an_error() {
        let frame = json!({"jsonrpc": "2.0", "result": {}, "id": 1});
        assert!(matches!(
            decode_response_envelope(&frame),
            Err(ResponseDecodeError::MissingEnvelope)
        ));
        let frame = json!({"jsonrpc": "2.0", "id": 1});
        assert!(matches!(
            decode_response_envelope(&frame),
            Err(ResponseDecodeError::MissingEnvelope)
        ));
    }

    #[test]
    fn malformed_result_envelope_is_an_error() {
        let frame = json!({"jsonrpc": "2.0", "result": {"envelope": {"id": 1}}, "id": 1});
        assert!(matches!(
            decode_response_envelope(&frame),
            Err(ResponseDecodeError::BadEnvelope(_))
        ));
    }

    #[test]
    fn numeric_and_string_ids_echo_byte_for_byte() {
        let env = sample_envelope();
        for id in [json!(17), json!("req-17"), Value::Null] {
            let resp = JsonRpcResponse::success(&env, id.clone());
            let frame = serde_json::to_value(&resp).unwrap();
            assert_eq!(frame["id"], id);
        }
    }

    #[test]
    fn ack_notification_has_null_id() {
        let env = sample_envelope();
        let frame = serde_json::to_value(JsonRpcRequest::ack_notification(&env)).unwrap();
        assert_eq!(frame["method"], "asap.ack");
        assert_eq!(frame["id"], Value::Null);
    }
}
