// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Core data model for the ASAP agent-to-agent messaging protocol:
//! the self-describing [`Envelope`], the typed [`Payload`] union, the
//! agent [`Manifest`], and [`AgentUrn`] identifiers.

pub mod envelope;
pub mod ids;
pub mod manifest;
pub mod payload;
pub mod urn;

pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeError};
pub use ids::generate_id;
pub use manifest::{AuthScheme, Capabilities, Endpoints, Manifest, ManifestError, OAuth2Config, Skill};
pub use payload::{
    AckStatus, MessageAck, Payload, PayloadError, TaskRequest, TaskResponse, TaskStatus,
    TaskUpdate, is_critical_payload_type,
};
pub use urn::{AgentUrn, UrnError};

/// Protocol version tag stamped on envelopes created by this runtime.
pub const ASAP_VERSION: &str = "0.1";
