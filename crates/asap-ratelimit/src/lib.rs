// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-ratelimit
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Rate limiting primitives for the ASAP runtime: a per-connection
//! [`TokenBucket`] guarding WebSocket message rates, and a
//! [`SlidingWindowLimiter`] used by the HTTP request middleware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default WebSocket inbound message rate (messages per second).
pub const DEFAULT_WS_MESSAGES_PER_SECOND: f64 = 20.0;

/// Token bucket with capacity equal to its refill rate.
///
/// Tokens refill proportionally to elapsed time, so a connection may
/// burst up to one second's worth of messages and then settles at the
/// configured steady rate.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket allowing `rate` messages per second.
    ///
    /// Non-finite or non-positive rates are clamped to 1.0.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        Self {
            rate,
            capacity: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// The configured steady rate.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Take `n` tokens; returns `false` (and takes nothing) when fewer
    /// than `n` are currently available.
    pub fn consume(&self, n: f64) -> bool {
        let mut state = self.state.lock().expect("token bucket lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }
}

/// Sliding-window limiter: at most `max_requests` within `window`.
///
/// Shareable across tasks; clones observe the same window.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    inner: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: u32,
    window: Duration,
}

impl SlidingWindowLimiter {
    /// Create a limiter allowing `max_requests` within `window`.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            window,
        }
    }

    /// The window size, used to derive `Retry-After` hints.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record one request; returns `false` when the window is full.
    pub fn check(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.inner.lock().expect("limiter lock poisoned");

        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() as u32 >= self.max_requests {
            return false;
        }
        timestamps.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_initial_burst_up_to_capacity() {
        let bucket = TokenBucket::new(5.0);
        for _ in 0..5 {
            assert!(bucket.consume(1.0));
        }
        assert!(!bucket.consume(1.0));
    }

    #[test]
    fn bucket_refills_with_time() {
        let bucket = TokenBucket::new(1000.0);
        while bucket.consume(1.0) {}
        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.consume(1.0));
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let bucket = TokenBucket::new(2.0);
        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.consume(2.0));
        assert!(!bucket.consume(2.0));
    }

    #[test]
    fn bucket_clamps_degenerate_rates() {
        assert_eq!(TokenBucket::new(0.0).rate(), 1.0);
        assert_eq!(TokenBucket::new(f64::NAN).rate(), 1.0);
        assert_eq!(TokenBucket::new(-3.0).rate(), 1.0);
    }

    #[test]
    fn window_denies_at_limit() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn window_expires_old_entries() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(10));
        assert!(limiter.check());
        assert!(!limiter.check());
        std::thread::sleep(Duration::from_millis(25));
        assert!(limiter.check());
    }

    #[test]
    fn clones_share_the_window() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        let other = limiter.clone();
        assert!(limiter.check());
        assert!(other.check());
        assert!(!limiter.check());
    }
}
