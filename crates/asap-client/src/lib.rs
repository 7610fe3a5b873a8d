// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-client
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Async HTTP client for ASAP envelope exchange: JSON-RPC wrapping,
//! connection pooling, retries with stable idempotency keys, circuit
//! breaking, request compression, ordered batch fan-out, and cached
//! manifest discovery.

pub mod cache;
pub mod client;
pub mod error;
pub mod sanitize;

pub use cache::ManifestCache;
pub use client::{AsapClient, ClientConfig};
pub use error::{ClientConfigError, ClientError};
pub use sanitize::sanitize_url;
