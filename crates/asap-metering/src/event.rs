// SPDX-License-Identifier: MIT OR Apache-2.0
//! The metered usage record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quantities metered for one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    /// Tokens consumed from the request side.
    #[serde(default)]
    pub tokens_in: u64,
    /// Tokens produced in the response.
    #[serde(default)]
    pub tokens_out: u64,
    /// Wall-clock handler duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Upstream API calls made while serving the task.
    #[serde(default)]
    pub api_calls: u64,
}

impl UsageMetrics {
    /// `tokens_in + tokens_out`.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// A per-task usage record.
///
/// Timestamps are always timezone-aware UTC instants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Task the usage belongs to.
    pub task_id: String,
    /// Agent that served the task.
    pub agent_id: String,
    /// Agent that requested the task.
    pub consumer_id: String,
    /// Metered quantities.
    pub metrics: UsageMetrics,
    /// When the task completed.
    pub timestamp: DateTime<Utc>,
}
