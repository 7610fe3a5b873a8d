// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-retry
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Fault-tolerance primitives shared by the ASAP transports: exponential
//! backoff with jitter, `Retry-After` parsing, and a three-state circuit
//! breaker with a process-wide per-endpoint registry.

pub mod backoff;
pub mod breaker;

pub use backoff::{RetryPolicy, parse_retry_after};
pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitOpenError, CircuitState, registry};

/// Default maximum attempts per logical send (first try included).
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY_SECS: f64 = 1.0;
/// Default backoff ceiling.
pub const DEFAULT_MAX_DELAY_SECS: f64 = 60.0;
/// Default consecutive failures before a breaker opens.
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
/// Default cooldown before an open breaker admits a probe.
pub const DEFAULT_BREAKER_TIMEOUT_SECS: f64 = 60.0;
