// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client error taxonomy.
//!
//! Every user-visible failure carries a sanitized URL where applicable
//! and a one-line troubleshooting hint. Errors that callers consume
//! programmatically ([`ClientError::Remote`], [`ClientError::Timeout`],
//! [`ClientError::CircuitOpen`]) expose their structured fields.

use asap_retry::CircuitOpenError;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors from constructing an [`crate::AsapClient`].
#[derive(Debug, Error)]
pub enum ClientConfigError {
    /// The base URL did not parse.
    #[error("invalid base_url {url:?}: must be a valid URL such as http://localhost:8000")]
    InvalidUrl {
        /// The offending input.
        url: String,
    },

    /// The scheme is neither `http` nor `https`.
    #[error("invalid URL scheme {scheme:?} in {url}: only http and https are allowed")]
    UnsupportedScheme {
        /// The offending scheme.
        scheme: String,
        /// Sanitized URL.
        url: String,
    },

    /// HTTP to a non-loopback host while `require_https` is set.
    #[error(
        "HTTPS is required for non-localhost connections, got {url}; \
         use https:// or disable require_https (not recommended for production)"
    )]
    HttpsRequired {
        /// Sanitized URL.
        url: String,
    },

    /// The underlying HTTP transport could not be built.
    #[error("failed to build HTTP transport: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Errors from sending envelopes or fetching manifests.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No TCP/TLS/DNS path to the agent, or an HTTP error status.
    #[error("connection error for {url}: {message}. Verify the agent is running and accessible")]
    Connection {
        /// Sanitized target URL.
        url: String,
        /// What failed.
        message: String,
    },

    /// The request exceeded its deadline.
    #[error("request timeout after {timeout:?}")]
    Timeout {
        /// The configured per-request timeout.
        timeout: Duration,
    },

    /// The remote agent answered with a JSON-RPC error object.
    #[error("remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Remote message.
        message: String,
        /// Structured remote detail.
        data: Option<Value>,
    },

    /// The endpoint's circuit breaker refused the send.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The manifest body failed schema validation.
    #[error("invalid manifest from {url}: {message}")]
    InvalidManifest {
        /// Sanitized manifest URL.
        url: String,
        /// Validation detail.
        message: String,
    },
}

impl ClientError {
    /// Whether a send-path failure may be retried with backoff.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}
