// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff and `Retry-After` handling.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::{DEFAULT_BASE_DELAY_SECS, DEFAULT_MAX_DELAY_SECS, DEFAULT_MAX_RETRIES};

/// Retry configuration for a client transport.
///
/// `max_retries` counts total attempts: with the default of 3, a send
/// makes the initial attempt plus up to two retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per logical send.
    pub max_retries: u32,
    /// Base delay for the exponential schedule.
    pub base_delay: Duration,
    /// Ceiling applied before jitter.
    pub max_delay: Duration,
    /// Whether to add a uniform jitter in `[0, delay / 10]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs_f64(DEFAULT_BASE_DELAY_SECS),
            max_delay: Duration::from_secs_f64(DEFAULT_MAX_DELAY_SECS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the zero-based `attempt`:
    /// `min(base_delay * 2^attempt, max_delay)` plus optional jitter.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let exp = base * 2f64.powi(attempt.min(62) as i32);
        let mut delay = exp.min(self.max_delay.as_secs_f64());
        if self.jitter {
            delay += rand::thread_rng().gen_range(0.0..=delay * 0.1);
        }
        Duration::from_secs_f64(delay)
    }
}

/// Parse a `Retry-After` header value relative to `now`.
///
/// Accepts numeric seconds (integral or fractional) or an HTTP-date.
/// Returns `None` for values that are invalid, negative, or in the past;
/// callers then fall back to their computed backoff.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs > 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    let secs = delta.num_milliseconds();
    if secs > 0 {
        Some(Duration::from_millis(secs as u64))
    } else {
        None
    }
}
