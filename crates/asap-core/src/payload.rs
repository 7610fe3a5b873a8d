// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed payload shapes referenced by the core.
//!
//! `payload` stays a raw JSON object at the wire boundary; handlers that
//! want structure go through [`Payload::from_envelope`], which maps the
//! envelope's `payload_type` tag onto a concrete shape. Unknown tags are
//! preserved as [`Payload::Other`] rather than rejected, so forwarding
//! code never loses data.

use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Canonical tag for task requests.
pub const PAYLOAD_TYPE_TASK_REQUEST: &str = "task.request";
/// Canonical tag for task responses.
pub const PAYLOAD_TYPE_TASK_RESPONSE: &str = "task.response";
/// Canonical tag for task progress updates.
pub const PAYLOAD_TYPE_TASK_UPDATE: &str = "task.update";
/// Canonical tag for message acknowledgements.
pub const PAYLOAD_TYPE_MESSAGE_ACK: &str = "MessageAck";

/// Payload types that imply `requires_ack` over WebSocket regardless of
/// the sender's flag. Dotted and PascalCase spellings are aliases; both
/// are honored and neither is canonicalized at ingress.
pub const CRITICAL_PAYLOAD_TYPES: &[&str] = &[
    "TaskRequest",
    "task.request",
    "TaskCancel",
    "task.cancel",
    "StateRestore",
    "state_restore",
    "MessageSend",
    "message.send",
    "message_send",
];

/// Whether `payload_type` is in the critical-ack set.
#[must_use]
pub fn is_critical_payload_type(payload_type: &str) -> bool {
    CRITICAL_PAYLOAD_TYPES.contains(&payload_type)
}

/// Errors from decoding a typed payload out of an envelope.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload object did not match the shape implied by its tag.
    #[error("payload does not match shape for {payload_type:?}: {source}")]
    Shape {
        /// The envelope's `payload_type` tag.
        payload_type: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// Lifecycle states of a task. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted, not yet started.
    Submitted,
    /// Currently executing.
    Working,
    /// Finished successfully.
    Completed,
    /// Cancelled before completion.
    Cancelled,
    /// Finished with an error.
    Failed,
}

/// Request to execute a skill within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Conversation this task belongs to.
    pub conversation_id: String,
    /// Skill the recipient should run.
    pub skill_id: String,
    /// Skill-specific input object.
    #[serde(default)]
    pub input: Value,
}

/// Reply to a [`TaskRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Identifier of the task this responds about.
    pub task_id: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Skill-specific result object, when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Agent-reported usage metrics (tokens, duration, api calls).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

/// Progress notification for a long-running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    /// Identifier of the task being reported on.
    pub task_id: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Free-form progress detail, e.g. `{"percent": 45, "message": "..."}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
}

/// Delivery state reported by a [`MessageAck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Frame arrived and was parsed.
    Received,
    /// Dispatch completed.
    Processed,
    /// Dispatch failed.
    Rejected,
}

/// Application-level acknowledgement frame (WebSocket only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAck {
    /// Id of the envelope being acknowledged.
    pub original_envelope_id: String,
    /// Delivery state.
    pub status: AckStatus,
    /// Error description when `status` is `rejected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sum type over the payload shapes the core knows about, discriminated
/// by the envelope's `payload_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A `task.request` / `TaskRequest` payload.
    TaskRequest(TaskRequest),
    /// A `task.response` / `TaskResponse` payload.
    TaskResponse(TaskResponse),
    /// A `task.update` / `TaskUpdate` payload.
    TaskUpdate(TaskUpdate),
    /// A `MessageAck` / `message.ack` payload.
    MessageAck(MessageAck),
    /// Any other tag; the raw object is kept verbatim.
    Other {
        /// The unrecognized tag.
        payload_type: String,
        /// The raw payload object.
        value: Value,
    },
}

impl Payload {
    /// Decode the typed payload for `envelope.payload_type`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Shape`] when a known tag is present but the
    /// object does not deserialize into the corresponding shape.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, PayloadError> {
        let value = Value::Object(envelope.payload().clone());
        let tag = envelope.payload_type();
        let shape = |source| PayloadError::Shape {
            payload_type: tag.to_string(),
            source,
        };
        match tag {
            "task.request" | "TaskRequest" => serde_json::from_value(value)
                .map(Payload::TaskRequest)
                .map_err(shape),
            "task.response" | "TaskResponse" => serde_json::from_value(value)
                .map(Payload::TaskResponse)
                .map_err(shape),
            "task.update" | "TaskUpdate" => serde_json::from_value(value)
                .map(Payload::TaskUpdate)
                .map_err(shape),
            "MessageAck" | "message.ack" => serde_json::from_value(value)
                .map(Payload::MessageAck)
                .map_err(shape),
            other => Ok(Payload::Other {
                payload_type: other.to_string(),
                value,
            }),
        }
    }

    /// Canonical `payload_type` tag for this shape.
    #[must_use]
    pub fn payload_type(&self) -> &str {
        match self {
            Payload::TaskRequest(_) => PAYLOAD_TYPE_TASK_REQUEST,
            Payload::TaskResponse(_) => PAYLOAD_TYPE_TASK_RESPONSE,
            Payload::TaskUpdate(_) => PAYLOAD_TYPE_TASK_UPDATE,
            Payload::MessageAck(_) => PAYLOAD_TYPE_MESSAGE_ACK,
            Payload::Other { payload_type, .. } => payload_type,
        }
    }
}
