// SPDX-License-Identifier: MIT OR Apache-2.0
//! The transport-level message record exchanged between agents.

use crate::ids::generate_id;
use crate::urn::{AgentUrn, UrnError};
use crate::ASAP_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Extension key carrying the per-sender replay nonce.
pub const EXTENSION_NONCE: &str = "nonce";

/// Errors from constructing an [`Envelope`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// A required builder field was never set.
    #[error("missing required envelope field: {0}")]
    MissingField(&'static str),

    /// `sender` or `recipient` is not a valid agent URN.
    #[error(transparent)]
    Urn(#[from] UrnError),

    /// The payload is not a JSON object.
    #[error("envelope payload must be a JSON object, got {0}")]
    PayloadNotObject(&'static str),
}

/// A self-describing message unit.
///
/// Envelopes are frozen after construction: every field is reachable only
/// through accessors, and replies are derived with [`Envelope::reply`]
/// rather than by mutation. `id` and `timestamp` are auto-filled when the
/// builder does not provide them. Unknown top-level fields are rejected
/// when decoding from the wire.
///
/// Equality is by `id`.
///
/// # Examples
///
/// ```
/// use asap_core::{AgentUrn, Envelope};
/// use serde_json::json;
///
/// let env = Envelope::builder()
///     .sender(AgentUrn::parse("urn:asap:agent:a").unwrap())
///     .recipient(AgentUrn::parse("urn:asap:agent:b").unwrap())
///     .payload_type("task.request")
///     .payload_json(json!({"conversation_id": "c1", "skill_id": "echo", "input": {}}))
///     .unwrap()
///     .build()
///     .unwrap();
///
/// assert_eq!(env.payload_type(), "task.request");
/// assert!(!env.id().is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    id: String,
    asap_version: String,
    sender: AgentUrn,
    recipient: AgentUrn,
    payload_type: String,
    payload: Map<String, Value>,
    #[serde(with = "timestamp_serde")]
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extensions: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    requires_ack: bool,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Envelope {}

impl Envelope {
    /// Start building a new envelope.
    #[must_use]
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::default()
    }

    /// Unique identifier, assigned at construction when absent.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Protocol version tag.
    #[must_use]
    pub fn asap_version(&self) -> &str {
        &self.asap_version
    }

    /// Originating agent.
    #[must_use]
    pub fn sender(&self) -> &AgentUrn {
        &self.sender
    }

    /// Destination agent.
    #[must_use]
    pub fn recipient(&self) -> &AgentUrn {
        &self.recipient
    }

    /// Opaque handler key, e.g. `"task.request"`.
    #[must_use]
    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    /// The payload as a JSON object, however it was constructed.
    #[must_use]
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Creation instant (UTC).
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Id of the originating envelope this one answers, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Trace identifier propagated verbatim through handlers.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Protocol extensions map, if present.
    #[must_use]
    pub fn extensions(&self) -> Option<&BTreeMap<String, Value>> {
        self.extensions.as_ref()
    }

    /// The `extensions.nonce` value, if present and a string.
    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get(EXTENSION_NONCE))
            .and_then(Value::as_str)
    }

    /// Whether an application-level acknowledgement is requested.
    #[must_use]
    pub fn requires_ack(&self) -> bool {
        self.requires_ack
    }

    /// Start a reply envelope: sender/recipient swapped, `correlation_id`
    /// set to this envelope's id, and `trace_id` carried over.
    #[must_use]
    pub fn reply(&self) -> EnvelopeBuilder {
        let mut builder = EnvelopeBuilder::default()
            .sender(self.recipient.clone())
            .recipient(self.sender.clone())
            .correlation_id(self.id.clone());
        if let Some(trace) = &self.trace_id {
            builder = builder.trace_id(trace.clone());
        }
        builder
    }
}

/// Fluent constructor for [`Envelope`].
#[derive(Debug, Default, Clone)]
pub struct EnvelopeBuilder {
    id: Option<String>,
    asap_version: Option<String>,
    sender: Option<AgentUrn>,
    recipient: Option<AgentUrn>,
    payload_type: Option<String>,
    payload: Option<Map<String, Value>>,
    timestamp: Option<DateTime<Utc>>,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    extensions: Option<BTreeMap<String, Value>>,
    requires_ack: bool,
}

impl EnvelopeBuilder {
    /// Caller-chosen envelope id (must be unique per conversation).
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the protocol version tag.
    #[must_use]
    pub fn asap_version(mut self, version: impl Into<String>) -> Self {
        self.asap_version = Some(version.into());
        self
    }

    /// Originating agent URN.
    #[must_use]
    pub fn sender(mut self, sender: AgentUrn) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Destination agent URN.
    #[must_use]
    pub fn recipient(mut self, recipient: AgentUrn) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Handler key for the payload.
    #[must_use]
    pub fn payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    /// Payload as a pre-built JSON object map.
    #[must_use]
    pub fn payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Payload from any JSON value; rejects non-objects.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::PayloadNotObject`] for non-object values.
    pub fn payload_json(mut self, payload: Value) -> Result<Self, EnvelopeError> {
        match payload {
            Value::Object(map) => {
                self.payload = Some(map);
                Ok(self)
            }
            other => Err(EnvelopeError::PayloadNotObject(json_type_name(&other))),
        }
    }

    /// Payload from a serializable typed value; rejects non-objects.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::PayloadNotObject`] when the value does not
    /// serialize to a JSON object.
    pub fn payload_typed<T: Serialize>(self, payload: &T) -> Result<Self, EnvelopeError> {
        let value =
            serde_json::to_value(payload).map_err(|_| EnvelopeError::PayloadNotObject("value"))?;
        self.payload_json(value)
    }

    /// Explicit creation timestamp.
    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Echo the originating envelope id.
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Trace identifier to propagate.
    #[must_use]
    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Insert a protocol extension entry.
    #[must_use]
    pub fn extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    /// Shorthand for the `nonce` extension.
    #[must_use]
    pub fn nonce(self, nonce: impl Into<String>) -> Self {
        self.extension(EXTENSION_NONCE, Value::String(nonce.into()))
    }

    /// Request an application-level acknowledgement.
    #[must_use]
    pub fn requires_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = requires_ack;
        self
    }

    /// Finalize the envelope, auto-filling `id` and `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MissingField`] when sender, recipient,
    /// payload type, or payload were never provided.
    pub fn build(self) -> Result<Envelope, EnvelopeError> {
        let sender = self.sender.ok_or(EnvelopeError::MissingField("sender"))?;
        let recipient = self
            .recipient
            .ok_or(EnvelopeError::MissingField("recipient"))?;
        let payload_type = self
            .payload_type
            .ok_or(EnvelopeError::MissingField("payload_type"))?;
        let payload = self.payload.ok_or(EnvelopeError::MissingField("payload"))?;

        Ok(Envelope {
            id: self.id.unwrap_or_else(generate_id),
            asap_version: self.asap_version.unwrap_or_else(|| ASAP_VERSION.to_string()),
            sender,
            recipient,
            payload_type,
            payload,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            correlation_id: self.correlation_id,
            trace_id: self.trace_id,
            extensions: self.extensions,
            requires_ack: self.requires_ack,
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// RFC 3339 timestamps; naive inputs (no offset) are treated as UTC.
mod timestamp_serde {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        if let Ok(with_offset) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(with_offset.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
