// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-ws
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! WebSocket client transport for ASAP: one JSON-RPC frame per text
//! message, a recv loop that demultiplexes responses / server pushes /
//! acknowledgements / heartbeats, an ack-retransmit loop, an optional
//! reconnect supervisor, and a bounded connection pool.

pub mod frames;
pub mod pool;
pub mod transport;

pub use frames::{decode_frame, encode_envelope_frame, is_app_ping, is_app_pong, pong_frame};
pub use pool::WebSocketConnectionPool;
pub use transport::{
    OnMessage, PendingAck, WebSocketTransport, WsConfig, WsError, on_message_fn, reconnect_delay,
};

use std::time::Duration;

/// Default deadline for `send_and_receive`.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);
/// First reconnect backoff step.
pub const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect backoff ceiling.
pub const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);
/// How often the ack loop scans for unacknowledged envelopes.
pub const ACK_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Age at which an unacknowledged envelope is retransmitted.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);
/// Retransmissions before an entry is dropped and the breaker charged.
pub const DEFAULT_MAX_ACK_RETRIES: u32 = 3;
/// Default bound on pooled connections per target URL.
pub const DEFAULT_POOL_MAX_SIZE: usize = 10;
/// Idle age at which a pooled connection is closed instead of reused.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
