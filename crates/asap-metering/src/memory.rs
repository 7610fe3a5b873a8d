// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory metering store (no persistence).

use crate::event::UsageEvent;
use crate::store::{
    GroupBy, MeteringError, MeteringQuery, MeteringStore, StorageStats, UsageAggregate,
    UsageSummary, aggregate_events, summarize_events,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// Mutex-guarded vector of events; the default store for tests and
/// single-process deployments that do not need durability.
#[derive(Debug, Default)]
pub struct InMemoryMeteringStore {
    retention: Option<Duration>,
    events: Mutex<Vec<UsageEvent>>,
}

impl InMemoryMeteringStore {
    /// Store without a retention TTL (events live forever).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose [`MeteringStore::purge_expired`] removes events older
    /// than `retention`.
    #[must_use]
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention: Some(retention),
            events: Mutex::new(Vec::new()),
        }
    }

    fn matching(&self, filters: &MeteringQuery) -> Vec<UsageEvent> {
        let events = self.events.lock().expect("metering lock poisoned");
        let mut out: Vec<UsageEvent> = events
            .iter()
            .filter(|e| filters.matches(e))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.timestamp);
        out
    }
}

#[async_trait]
impl MeteringStore for InMemoryMeteringStore {
    async fn record(&self, event: UsageEvent) -> Result<(), MeteringError> {
        let mut events = self.events.lock().expect("metering lock poisoned");
        events.push(event);
        Ok(())
    }

    async fn query(&self, query: &MeteringQuery) -> Result<Vec<UsageEvent>, MeteringError> {
        let mut out = self.matching(query);
        let offset = query.offset.unwrap_or(0);
        if offset > 0 {
            out = out.split_off(offset.min(out.len()));
        }
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn aggregate(
        &self,
        group_by: GroupBy,
        filters: &MeteringQuery,
    ) -> Result<Vec<UsageAggregate>, MeteringError> {
        Ok(aggregate_events(group_by, &self.matching(filters)))
    }

    async fn summary(&self, filters: &MeteringQuery) -> Result<UsageSummary, MeteringError> {
        Ok(summarize_events(&self.matching(filters)))
    }

    async fn stats(&self) -> Result<StorageStats, MeteringError> {
        let events = self.events.lock().expect("metering lock poisoned");
        Ok(StorageStats {
            total_events: events.len() as u64,
            oldest_timestamp: events.iter().map(|e| e.timestamp).min(),
            retention_ttl_seconds: self.retention.map(|d| d.as_secs()),
        })
    }

    async fn purge_expired(&self) -> Result<u64, MeteringError> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let cutoff = Utc::now()
            - ChronoDuration::from_std(retention)
                .map_err(|e| MeteringError::Storage(e.to_string()))?;
        let mut events = self.events.lock().expect("metering lock poisoned");
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok((before - events.len()) as u64)
    }
}
