// SPDX-License-Identifier: MIT OR Apache-2.0
//! The metering storage interface and its query / aggregate types.

use crate::event::UsageEvent;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

/// Errors from a metering store.
#[derive(Debug, Error)]
pub enum MeteringError {
    /// Underlying storage failure.
    #[error("metering storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for MeteringError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Filters applied by [`MeteringStore::query`] and the aggregate methods.
///
/// The time range is half-open: `start <= timestamp < end`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeteringQuery {
    /// Only events served by this agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Only events requested by this consumer.
    #[serde(default)]
    pub consumer_id: Option<String>,
    /// Only events for this task.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Inclusive lower bound.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Page size.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Page offset.
    #[serde(default)]
    pub offset: Option<usize>,
}

impl MeteringQuery {
    /// Whether `event` passes every filter except pagination.
    #[must_use]
    pub fn matches(&self, event: &UsageEvent) -> bool {
        if let Some(agent) = &self.agent_id {
            if &event.agent_id != agent {
                return false;
            }
        }
        if let Some(consumer) = &self.consumer_id {
            if &event.consumer_id != consumer {
                return false;
            }
        }
        if let Some(task) = &self.task_id {
            if &event.task_id != task {
                return false;
            }
        }
        if let Some(start) = self.start {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if event.timestamp >= end {
                return false;
            }
        }
        true
    }
}

/// Supported aggregation groupings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    /// Group by serving agent.
    Agent,
    /// Group by consumer.
    Consumer,
    /// Group by UTC calendar day (`YYYY-MM-DD`).
    Day,
    /// Group by ISO week (`YYYY-Www`).
    Week,
}

impl FromStr for GroupBy {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "consumer" => Ok(Self::Consumer),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            other => Err(MeteringError::Storage(format!(
                "unknown group_by value: {other:?}"
            ))),
        }
    }
}

impl GroupBy {
    /// The bucket key `event` falls into.
    #[must_use]
    pub fn key_for(&self, event: &UsageEvent) -> String {
        match self {
            Self::Agent => event.agent_id.clone(),
            Self::Consumer => event.consumer_id.clone(),
            Self::Day => event.timestamp.format("%Y-%m-%d").to_string(),
            Self::Week => {
                let week = event.timestamp.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }
}

/// Per-group totals returned by [`MeteringStore::aggregate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAggregate {
    /// The group key (agent URN, consumer URN, day, or ISO week).
    pub group: String,
    /// `Σ (tokens_in + tokens_out)`.
    pub total_tokens: u64,
    /// Number of events in the group.
    pub total_tasks: u64,
    /// `Σ api_calls`.
    pub total_api_calls: u64,
    /// `Σ duration_ms`.
    pub total_duration_ms: u64,
}

/// Overall totals returned by [`MeteringStore::summary`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// `Σ (tokens_in + tokens_out)`.
    pub total_tokens: u64,
    /// Number of matching events.
    pub total_tasks: u64,
    /// `Σ api_calls`.
    pub total_api_calls: u64,
    /// `Σ duration_ms`.
    pub total_duration_ms: u64,
    /// Distinct serving agents.
    pub unique_agents: u64,
    /// Distinct consumers.
    pub unique_consumers: u64,
}

/// Store health counters returned by [`MeteringStore::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Events currently stored.
    pub total_events: u64,
    /// Timestamp of the oldest stored event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_timestamp: Option<DateTime<Utc>>,
    /// Retention TTL, absent when events are kept forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_ttl_seconds: Option<u64>,
}

/// Interface implemented by every metering backend.
///
/// All methods are safe to call concurrently.
#[async_trait]
pub trait MeteringStore: Send + Sync {
    /// Append one event.
    async fn record(&self, event: UsageEvent) -> Result<(), MeteringError>;

    /// Events matching the filters, oldest first, paginated by
    /// `limit`/`offset`.
    async fn query(&self, query: &MeteringQuery) -> Result<Vec<UsageEvent>, MeteringError>;

    /// Per-group totals over the filtered events.
    async fn aggregate(
        &self,
        group_by: GroupBy,
        filters: &MeteringQuery,
    ) -> Result<Vec<UsageAggregate>, MeteringError>;

    /// Overall totals plus distinct-agent/consumer counts.
    async fn summary(&self, filters: &MeteringQuery) -> Result<UsageSummary, MeteringError>;

    /// Store health counters.
    async fn stats(&self) -> Result<StorageStats, MeteringError>;

    /// Remove events older than the retention TTL; returns how many were
    /// removed, 0 when no TTL is configured.
    async fn purge_expired(&self) -> Result<u64, MeteringError>;
}

/// Shared aggregation over an in-memory slice of matching events; the
/// SQLite store reuses this for the time-bucketed groupings.
pub(crate) fn aggregate_events(group_by: GroupBy, events: &[UsageEvent]) -> Vec<UsageAggregate> {
    let mut buckets: std::collections::BTreeMap<String, UsageAggregate> =
        std::collections::BTreeMap::new();
    for event in events {
        let key = group_by.key_for(event);
        let agg = buckets.entry(key.clone()).or_insert_with(|| UsageAggregate {
            group: key,
            total_tokens: 0,
            total_tasks: 0,
            total_api_calls: 0,
            total_duration_ms: 0,
        });
        agg.total_tokens += event.metrics.total_tokens();
        agg.total_tasks += 1;
        agg.total_api_calls += event.metrics.api_calls;
        agg.total_duration_ms += event.metrics.duration_ms;
    }
    buckets.into_values().collect()
}

/// Shared summary computation over matching events.
pub(crate) fn summarize_events(events: &[UsageEvent]) -> UsageSummary {
    let mut agents = BTreeSet::new();
    let mut consumers = BTreeSet::new();
    let mut summary = UsageSummary::default();
    for event in events {
        summary.total_tokens += event.metrics.total_tokens();
        summary.total_tasks += 1;
        summary.total_api_calls += event.metrics.api_calls;
        summary.total_duration_ms += event.metrics.duration_ms;
        agents.insert(event.agent_id.as_str());
        consumers.insert(event.consumer_id.as_str());
    }
    summary.unique_agents = agents.len() as u64;
    summary.unique_consumers = consumers.len() as u64;
    summary
}
