// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket frame encoding.
//!
//! One text frame carries one JSON-RPC payload. Application-level
//! heartbeats are bare `{"type":"ping"}` / `{"type":"pong"}` objects,
//! distinguishable from JSON-RPC frames by the absence of `method`.
//! A binary/base64 mode is reserved but unused.

use asap_protocol::jsonrpc::{ASAP_METHOD, JSONRPC_VERSION};
use serde_json::{Value, json};

/// Build an `asap.send` request frame around an already-serialized
/// envelope object.
///
/// The envelope is passed as a [`Value`] rather than an
/// [`asap_core::Envelope`] so the transport can adjust the wire form
/// (e.g. forcing `requires_ack` for critical payload types) without
/// mutating the caller's envelope.
#[must_use]
pub fn encode_envelope_frame(envelope_wire: &Value, request_id: &str) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": ASAP_METHOD,
        "params": { "envelope": envelope_wire },
        "id": request_id,
    })
    .to_string()
}

/// Parse one text frame into JSON.
///
/// # Errors
///
/// Returns the underlying serde error for invalid JSON; callers drop
/// (and log) such frames.
pub fn decode_frame(raw: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Whether `frame` is an application-level heartbeat ping.
#[must_use]
pub fn is_app_ping(frame: &Value) -> bool {
    frame.get("type").and_then(Value::as_str) == Some("ping") && frame.get("method").is_none()
}

/// Whether `frame` is an application-level heartbeat pong.
#[must_use]
pub fn is_app_pong(frame: &Value) -> bool {
    frame.get("type").and_then(Value::as_str) == Some("pong") && frame.get("method").is_none()
}

/// The heartbeat pong reply frame.
#[must_use]
pub fn pong_frame() -> String {
    json!({"type": "pong"}).to_string()
}

/// The heartbeat ping frame sent by servers.
#[must_use]
pub fn ping_frame() -> String {
    json!({"type": "ping"}).to_string()
}
