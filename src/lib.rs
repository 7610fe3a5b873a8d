// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reference runtime for the ASAP agent-to-agent messaging protocol.
//!
//! This facade re-exports the workspace crates; depend on the
//! individual `asap-*` crates directly when you only need one side of
//! the transport.

#![deny(unsafe_code)]

pub use asap_client;
pub use asap_core;
pub use asap_metering;
pub use asap_protocol;
pub use asap_ratelimit;
pub use asap_retry;
pub use asap_server;
pub use asap_telemetry;
pub use asap_ws;

pub use asap_client::{AsapClient, ClientConfig, ClientError};
pub use asap_core::{AgentUrn, Envelope, Manifest, Payload, ASAP_VERSION};
pub use asap_server::{AppState, AsapHandler, HandlerRegistry, build_app};
pub use asap_ws::{WebSocketConnectionPool, WebSocketTransport};
