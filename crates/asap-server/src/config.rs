// SPDX-License-Identifier: MIT OR Apache-2.0
//! Daemon configuration: TOML file with environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from loading a [`ServerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path that failed.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// Which metering store the daemon opens.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeteringBackend {
    /// No metering; `/usage` routes are not mounted.
    #[default]
    Disabled,
    /// In-memory store (lost on restart).
    Memory,
    /// SQLite file at `metering_db_path`.
    Sqlite,
}

/// Daemon settings. Every field has a default so an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub bind: String,
    /// Include handler error detail in JSON-RPC error bodies.
    pub debug: bool,
    /// Ceiling on request bodies, before and after decompression.
    pub max_request_size: usize,
    /// Body size at or above which responses are compressed.
    pub compression_threshold: usize,
    /// Require and replay-check `extensions.nonce`.
    pub require_nonce: bool,
    /// Envelope age ceiling in seconds.
    pub max_envelope_age_seconds: i64,
    /// Clock-ahead tolerance in seconds.
    pub max_future_tolerance_seconds: i64,
    /// Global request cap per window; `None` disables the limiter.
    pub rate_limit_requests: Option<u32>,
    /// Window for the global request cap.
    pub rate_limit_window_seconds: u64,
    /// Per-connection WebSocket message rate; `None` disables the bucket.
    pub ws_messages_per_second: Option<f64>,
    /// Blocking-handler worker pool size.
    pub max_threads: usize,
    /// Metering backend selection.
    pub metering: MeteringBackend,
    /// SQLite file for [`MeteringBackend::Sqlite`].
    pub metering_db_path: PathBuf,
    /// Usage-event retention in seconds; `None` keeps events forever.
    pub metering_retention_seconds: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".into(),
            debug: false,
            max_request_size: 10 * 1024 * 1024,
            compression_threshold: asap_protocol::COMPRESSION_THRESHOLD,
            require_nonce: false,
            max_envelope_age_seconds: asap_protocol::MAX_ENVELOPE_AGE_SECONDS,
            max_future_tolerance_seconds: asap_protocol::MAX_FUTURE_TOLERANCE_SECONDS,
            rate_limit_requests: None,
            rate_limit_window_seconds: 60,
            ws_messages_per_second: Some(asap_ratelimit::DEFAULT_WS_MESSAGES_PER_SECOND),
            max_threads: crate::handler::DEFAULT_MAX_THREADS,
            metering: MeteringBackend::Disabled,
            metering_db_path: PathBuf::from("asap-usage.db"),
            metering_retention_seconds: None,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the file is unreadable or malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `ASAP_BIND` and `ASAP_DEBUG` win over file values, so container
    /// deployments can retarget without editing the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("ASAP_BIND") {
            if !bind.is_empty() {
                self.bind = bind;
            }
        }
        if let Ok(debug) = std::env::var("ASAP_DEBUG") {
            self.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }
    }
}
