// SPDX-License-Identifier: MIT OR Apache-2.0
//! Three-state circuit breaker, shared per endpoint base URL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

use crate::{DEFAULT_BREAKER_THRESHOLD, DEFAULT_BREAKER_TIMEOUT_SECS};

/// Health gate state for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow; failures are being counted.
    Closed,
    /// Requests are refused until the cooldown elapses.
    Open,
    /// One probe request is admitted; its outcome decides the next state.
    HalfOpen,
}

/// Raised instead of a network call when the breaker is open.
#[derive(Debug, Clone, Error)]
#[error(
    "circuit breaker open for {base_url} after {consecutive_failures} consecutive failures; \
     refusing to send until the cooldown elapses"
)]
pub struct CircuitOpenError {
    /// Sanitized endpoint base URL.
    pub base_url: String,
    /// Failure count at the time the breaker opened.
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: bool,
}

/// Per-endpoint circuit breaker.
///
/// Counts only network-layer failures (connect errors, timeouts, retry
/// exhaustion on 5xx/429, persistent 4xx). Application-level JSON-RPC
/// errors arriving over HTTP 200 are recorded as successes: the
/// transport itself is healthy.
///
/// # Examples
///
/// ```
/// use asap_retry::CircuitBreaker;
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
/// assert!(breaker.can_attempt());
/// breaker.record_failure();
/// breaker.record_failure();
/// assert!(!breaker.can_attempt());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` consecutive failures
    /// and admits a probe after `timeout`.
    #[must_use]
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: false,
            }),
        }
    }

    /// Breaker with the default threshold and cooldown.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_BREAKER_THRESHOLD,
            Duration::from_secs_f64(DEFAULT_BREAKER_TIMEOUT_SECS),
        )
    }

    /// Configured failure threshold.
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Whether a request may be attempted right now.
    ///
    /// An open breaker transitions to half-open once its cooldown has
    /// elapsed; in half-open, exactly one probe is admitted until its
    /// outcome is recorded.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight {
                    false
                } else {
                    inner.half_open_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful attempt; closes the breaker and resets counts.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_in_flight = false;
    }

    /// Record a failed attempt.
    ///
    /// Opens the breaker when the consecutive-failure threshold is hit, or
    /// immediately when a half-open probe fails.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.threshold;
        if should_open {
            if inner.state != CircuitState::Open {
                warn!(
                    consecutive_failures = inner.consecutive_failures,
                    threshold = self.threshold,
                    "circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_in_flight = false;
        }
    }

    /// Current state (may be stale by the time the caller acts on it).
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Current consecutive failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .consecutive_failures
    }
}

/// Process-wide map of base URL → shared breaker.
///
/// Two clients pointed at the same endpoint observe the same breaker
/// state, so one client's failures protect the other.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create an empty registry (tests use locals; production code uses
    /// [`registry`]).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker for `base_url`, creating it with the given
    /// parameters on first use. Later callers get the existing breaker
    /// regardless of their parameters.
    pub fn get_or_create(
        &self,
        base_url: &str,
        threshold: u32,
        timeout: Duration,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers
            .entry(base_url.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(threshold, timeout)))
            .clone()
    }

    /// Number of distinct endpoints tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.lock().expect("registry lock poisoned").len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: OnceLock<BreakerRegistry> = OnceLock::new();

/// The process-wide breaker registry.
pub fn registry() -> &'static BreakerRegistry {
    REGISTRY.get_or_init(BreakerRegistry::new)
}
