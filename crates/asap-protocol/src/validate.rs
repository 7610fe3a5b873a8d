// SPDX-License-Identifier: MIT OR Apache-2.0
//! Server-side envelope validation pipeline.
//!
//! Checks run in a fixed order: timestamp, then nonce (when required),
//! then sender-vs-auth. Timestamp validation runs first so stale
//! requests never populate the nonce store.

use asap_core::{AgentUrn, Envelope};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Maximum accepted envelope age relative to the server clock.
pub const MAX_ENVELOPE_AGE_SECONDS: i64 = 300;

/// Maximum accepted clock-ahead offset.
pub const MAX_FUTURE_TOLERANCE_SECONDS: i64 = 30;

/// Default replay-window TTL for stored nonces.
pub const DEFAULT_NONCE_TTL_SECONDS: u64 = 600;

/// Validation pipeline settings.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Reject envelopes whose age reaches this many seconds.
    pub max_age_seconds: i64,
    /// Reject envelopes more than this many seconds ahead of the clock.
    pub max_future_seconds: i64,
    /// Whether `extensions.nonce` is mandatory and replay-checked.
    pub require_nonce: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_age_seconds: MAX_ENVELOPE_AGE_SECONDS,
            max_future_seconds: MAX_FUTURE_TOLERANCE_SECONDS,
            require_nonce: false,
        }
    }
}

/// A failed validation check.
///
/// The JSON-RPC mapping is [`ValidationError::code`]: every variant is
/// invalid-params except the sender mismatch, which is an invalid
/// request surfaced as HTTP 403.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Envelope timestamp is older than the acceptance window.
    #[error("envelope timestamp too old: age {age_seconds}s exceeds {max_age_seconds}s")]
    TimestampTooOld {
        /// Observed age in whole seconds.
        age_seconds: i64,
        /// Configured ceiling.
        max_age_seconds: i64,
    },

    /// Envelope timestamp is too far in the future.
    #[error("envelope timestamp in the future by {ahead_seconds}s (tolerance {tolerance_seconds}s)")]
    TimestampInFuture {
        /// Observed clock-ahead offset in whole seconds.
        ahead_seconds: i64,
        /// Configured tolerance.
        tolerance_seconds: i64,
    },

    /// Nonce required but the envelope carries none.
    #[error("envelope nonce missing: extensions.nonce is required by this server")]
    NonceMissing,

    /// The nonce was already seen within the replay window.
    #[error("envelope nonce reused: {nonce:?} was already seen within the replay window")]
    NonceReused {
        /// The rejected nonce.
        nonce: String,
    },

    /// Authenticated agent does not match `envelope.sender`.
    #[error("sender mismatch: authenticated as {authenticated} but envelope sender is {sender}")]
    SenderMismatch {
        /// Agent resolved by the auth middleware.
        authenticated: String,
        /// The envelope's claimed sender.
        sender: String,
    },
}

impl ValidationError {
    /// JSON-RPC error code for this failure.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::SenderMismatch { .. } => crate::jsonrpc::error_codes::INVALID_REQUEST,
            _ => crate::jsonrpc::error_codes::INVALID_PARAMS,
        }
    }
}

/// Process-wide replay-protection store.
///
/// Nonces are scoped per sender and expire after the replay-window TTL.
/// Expired entries are purged lazily on insert.
#[derive(Debug)]
pub struct NonceStore {
    ttl: Duration,
    seen: Mutex<HashMap<(String, String), Instant>>,
}

impl Default for NonceStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_NONCE_TTL_SECONDS))
    }
}

impl NonceStore {
    /// Create a store whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `nonce` for `sender`. Returns `false` when the nonce was
    /// already present (replay).
    pub fn check_and_store(&self, sender: &AgentUrn, nonce: &str) -> bool {
        let mut seen = self.seen.lock().expect("nonce store lock poisoned");
        let now = Instant::now();
        seen.retain(|_, stored_at| now.duration_since(*stored_at) < self.ttl);
        let key = (sender.as_str().to_string(), nonce.to_string());
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }

    /// Whether `nonce` is currently stored for `sender`.
    #[must_use]
    pub fn contains(&self, sender: &AgentUrn, nonce: &str) -> bool {
        let seen = self.seen.lock().expect("nonce store lock poisoned");
        seen.get(&(sender.as_str().to_string(), nonce.to_string()))
            .is_some_and(|stored_at| stored_at.elapsed() < self.ttl)
    }

    /// Number of live entries (expired entries may still be counted
    /// until the next insert purges them).
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().expect("nonce store lock poisoned").len()
    }

    /// Whether the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static GLOBAL_NONCES: OnceLock<NonceStore> = OnceLock::new();

/// The process-wide nonce store.
pub fn global_nonce_store() -> &'static NonceStore {
    GLOBAL_NONCES.get_or_init(NonceStore::default)
}

/// Run the full pipeline against `envelope` at `now`.
///
/// `authenticated` is the agent resolved by the auth middleware, when a
/// request carried valid credentials; `None` skips the sender check.
///
/// # Errors
///
/// Returns the first failed check as a [`ValidationError`].
pub fn validate_envelope(
    envelope: &Envelope,
    config: &ValidationConfig,
    nonces: &NonceStore,
    authenticated: Option<&AgentUrn>,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    validate_timestamp(envelope.timestamp(), config, now)?;

    if config.require_nonce {
        match envelope.nonce() {
            None => return Err(ValidationError::NonceMissing),
            Some(nonce) => {
                if !nonces.check_and_store(envelope.sender(), nonce) {
                    return Err(ValidationError::NonceReused {
                        nonce: nonce.to_string(),
                    });
                }
            }
        }
    }

    if let Some(agent) = authenticated {
        if agent != envelope.sender() {
            return Err(ValidationError::SenderMismatch {
                authenticated: agent.as_str().to_string(),
                sender: envelope.sender().as_str().to_string(),
            });
        }
    }

    Ok(())
}

fn validate_timestamp(
    timestamp: DateTime<Utc>,
    config: &ValidationConfig,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    let delta_ms = (now - timestamp).num_milliseconds();
    if delta_ms >= config.max_age_seconds * 1000 {
        return Err(ValidationError::TimestampTooOld {
            age_seconds: delta_ms / 1000,
            max_age_seconds: config.max_age_seconds,
        });
    }
    if delta_ms < 0 {
        let ahead_ms = -delta_ms;
        if ahead_ms > config.max_future_seconds * 1000 {
            return Err(ValidationError::TimestampInFuture {
                ahead_seconds: ahead_ms / 1000,
                tolerance_seconds: config.max_future_seconds,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn urn(name: &str) -> AgentUrn {
        AgentUrn::parse(format!("urn:asap:agent:{name}")).unwrap()
    }

    fn envelope_at(ts: DateTime<Utc>, nonce: Option<&str>) -> Envelope {
        let mut builder = Envelope::builder()
            .sender(urn("a"))
            .recipient(urn("b"))
            .payload_type("task.request")
            .payload_json(json!({}))
            .unwrap()
            .timestamp(ts);
        if let Some(n) = nonce {
            builder = builder.nonce(n);
        }
        builder.build().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn fresh_timestamp_passes() {
        let env = envelope_at(now(), None);
        let store = NonceStore::default();
        validate_envelope(&env, &ValidationConfig::default(), &store, None, now()).unwrap();
    }

    #[test]
    fn age_just_inside_ceiling_accepted_at_ceiling_rejected() {
        let config = ValidationConfig::default();
        let store = NonceStore::default();

        let inside = envelope_at(now() - chrono::Duration::milliseconds(299_900), None);
        validate_envelope(&inside, &config, &store, None, now()).unwrap();

        let at = envelope_at(now() - chrono::Duration::seconds(300), None);
        let err = validate_envelope(&at, &config, &store, None, now()).unwrap_err();
        assert!(matches!(err, ValidationError::TimestampTooOld { .. }));
        assert!(err.to_string().contains("too old"));
    }

    #[test]
    fn future_within_tolerance_accepted_beyond_rejected() {
        let config = ValidationConfig::default();
        let store = NonceStore::default();

        let inside = envelope_at(now() + chrono::Duration::seconds(30), None);
        validate_envelope(&inside, &config, &store, None, now()).unwrap();

        let beyond = envelope_at(now() + chrono::Duration::seconds(31), None);
        let err = validate_envelope(&beyond, &config, &store, None, now()).unwrap_err();
        assert!(matches!(err, ValidationError::TimestampInFuture { .. }));
        assert!(err.to_string().contains("future"));
    }

    #[test]
    fn nonce_first_use_accepted_reuse_rejected() {
        let config = ValidationConfig {
            require_nonce: true,
            ..ValidationConfig::default()
        };
        let store = NonceStore::default();

        let first = envelope_at(now(), Some("n1"));
        validate_envelope(&first, &config, &store, None, now()).unwrap();

        let second = envelope_at(now(), Some("n1"));
        let err = validate_envelope(&second, &config, &store, None, now()).unwrap_err();
        assert!(matches!(err, ValidationError::NonceReused { .. }));
        assert!(err.to_string().contains("nonce"));
        assert_eq!(err.code(), crate::jsonrpc::error_codes::INVALID_PARAMS);
    }

    #[test]
    fn missing_nonce_rejected_when_required() {
        let config = ValidationConfig {
            require_nonce: true,
            ..ValidationConfig::default()
        };
        let store = NonceStore::default();
        let err = validate_envelope(&envelope_at(now(), None), &config, &store, None, now())
            .unwrap_err();
        assert_eq!(err, ValidationError::NonceMissing);
    }

    #[test]
    fn stale_timestamp_never_populates_nonce_store() {
        let config = ValidationConfig {
            require_nonce: true,
            ..ValidationConfig::default()
        };
        let store = NonceStore::default();
        let stale = envelope_at(now() - chrono::Duration::seconds(600), Some("n2"));
        let err = validate_envelope(&stale, &config, &store, None, now()).unwrap_err();
        assert!(matches!(err, ValidationError::TimestampTooOld { .. }));
        assert!(!store.contains(&urn("a"), "n2"));
    }

    #[test]
    fn nonces_are_scoped_per_sender() {
        let store = NonceStore::default();
        assert!(store.check_and_store(&urn("a"), "n1"));
        assert!(store.check_and_store(&urn("b"), "n1"));
        assert!(!store.check_and_store(&urn("a"), "n1"));
    }

    #[test]
    fn nonce_entries_expire_after_ttl() {
        let store = NonceStore::new(Duration::from_millis(10));
        assert!(store.check_and_store(&urn("a"), "n1"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(!store.contains(&urn("a"), "n1"));
        assert!(store.check_and_store(&urn("a"), "n1"));
    }

    #[test]
    fn sender_must_match_authenticated_agent() {
        let config = ValidationConfig::default();
        let store = NonceStore::default();
        let env = envelope_at(now(), None);

        validate_envelope(&env, &config, &store, Some(&urn("a")), now()).unwrap();

        let err = validate_envelope(&env, &config, &store, Some(&urn("c")), now()).unwrap_err();
        assert!(matches!(err, ValidationError::SenderMismatch { .. }));
        assert_eq!(err.code(), crate::jsonrpc::error_codes::INVALID_REQUEST);
    }

    #[test]
    fn unauthenticated_requests_skip_sender_check() {
        let env = envelope_at(now(), None);
        let store = NonceStore::default();
        validate_envelope(&env, &ValidationConfig::default(), &store, None, now()).unwrap();
    }
}
