// SPDX-License-Identifier: MIT OR Apache-2.0
//! SQLite-backed metering store.
//!
//! One table keyed by `(timestamp, task_id)` with indexes on `agent_id`,
//! `consumer_id`, and `task_id`. A single `Mutex<Connection>` serialises
//! writers and readers, so `purge_expired` and `record` never interleave.
//! Timestamps are stored as fixed-width RFC 3339 UTC strings, which makes
//! lexicographic comparison equal to chronological comparison.

use crate::event::{UsageEvent, UsageMetrics};
use crate::store::{
    GroupBy, MeteringError, MeteringQuery, MeteringStore, StorageStats, UsageAggregate,
    UsageSummary, aggregate_events,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage_events (
    timestamp    TEXT NOT NULL,
    task_id      TEXT NOT NULL,
    agent_id     TEXT NOT NULL,
    consumer_id  TEXT NOT NULL,
    tokens_in    INTEGER NOT NULL DEFAULT 0,
    tokens_out   INTEGER NOT NULL DEFAULT 0,
    duration_ms  INTEGER NOT NULL DEFAULT 0,
    api_calls    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (timestamp, task_id)
);
CREATE INDEX IF NOT EXISTS idx_usage_agent    ON usage_events (agent_id);
CREATE INDEX IF NOT EXISTS idx_usage_consumer ON usage_events (consumer_id);
CREATE INDEX IF NOT EXISTS idx_usage_task     ON usage_events (task_id);
";

fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, MeteringError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| MeteringError::Storage(format!("bad stored timestamp {raw:?}: {e}")))
}

/// File-backed metering store over a single SQLite database.
pub struct SqliteMeteringStore {
    retention: Option<Duration>,
    conn: Mutex<Connection>,
}

impl SqliteMeteringStore {
    /// Open (creating if needed) the database at `path` without a
    /// retention TTL.
    ///
    /// # Errors
    ///
    /// Returns [`MeteringError::Storage`] when the file cannot be opened
    /// or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MeteringError> {
        Self::open_with_retention(path, None)
    }

    /// Open the database at `path`, purging events older than
    /// `retention` on [`MeteringStore::purge_expired`].
    ///
    /// # Errors
    ///
    /// Returns [`MeteringError::Storage`] when the file cannot be opened
    /// or the schema cannot be applied.
    pub fn open_with_retention(
        path: impl AsRef<Path>,
        retention: Option<Duration>,
    ) -> Result<Self, MeteringError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            retention,
            conn: Mutex::new(conn),
        })
    }

    /// In-memory SQLite database, useful in tests.
    ///
    /// # Errors
    ///
    /// Returns [`MeteringError::Storage`] when the schema cannot be
    /// applied.
    pub fn open_in_memory() -> Result<Self, MeteringError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            retention: None,
            conn: Mutex::new(conn),
        })
    }

    fn where_clause(filters: &MeteringQuery) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(agent) = &filters.agent_id {
            clauses.push("agent_id = ?".to_string());
            params.push(agent.clone());
        }
        if let Some(consumer) = &filters.consumer_id {
            clauses.push("consumer_id = ?".to_string());
            params.push(consumer.clone());
        }
        if let Some(task) = &filters.task_id {
            clauses.push("task_id = ?".to_string());
            params.push(task.clone());
        }
        if let Some(start) = filters.start {
            clauses.push("timestamp >= ?".to_string());
            params.push(encode_ts(start));
        }
        if let Some(end) = filters.end {
            clauses.push("timestamp < ?".to_string());
            params.push(encode_ts(end));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (where_sql, params)
    }

    fn fetch(&self, filters: &MeteringQuery, paginate: bool) -> Result<Vec<UsageEvent>, MeteringError> {
        let (where_sql, params) = Self::where_clause(filters);
        let mut sql = format!(
            "SELECT timestamp, task_id, agent_id, consumer_id, tokens_in, tokens_out, \
             duration_ms, api_calls FROM usage_events{where_sql} ORDER BY timestamp ASC"
        );
        if paginate {
            if let Some(limit) = filters.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
                if let Some(offset) = filters.offset {
                    sql.push_str(&format!(" OFFSET {offset}"));
                }
            } else if let Some(offset) = filters.offset {
                sql.push_str(&format!(" LIMIT -1 OFFSET {offset}"));
            }
        }

        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (ts, task_id, agent_id, consumer_id, tokens_in, tokens_out, duration_ms, api_calls) =
                row?;
            events.push(UsageEvent {
                task_id,
                agent_id,
                consumer_id,
                metrics: UsageMetrics {
                    tokens_in: tokens_in.max(0) as u64,
                    tokens_out: tokens_out.max(0) as u64,
                    duration_ms: duration_ms.max(0) as u64,
                    api_calls: api_calls.max(0) as u64,
                },
                timestamp: decode_ts(&ts)?,
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl MeteringStore for SqliteMeteringStore {
    async fn record(&self, event: UsageEvent) -> Result<(), MeteringError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO usage_events \
             (timestamp, task_id, agent_id, consumer_id, tokens_in, tokens_out, duration_ms, api_calls) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                encode_ts(event.timestamp),
                event.task_id,
                event.agent_id,
                event.consumer_id,
                event.metrics.tokens_in as i64,
                event.metrics.tokens_out as i64,
                event.metrics.duration_ms as i64,
                event.metrics.api_calls as i64,
            ],
        )?;
        Ok(())
    }

    async fn query(&self, query: &MeteringQuery) -> Result<Vec<UsageEvent>, MeteringError> {
        self.fetch(query, true)
    }

    async fn aggregate(
        &self,
        group_by: GroupBy,
        filters: &MeteringQuery,
    ) -> Result<Vec<UsageAggregate>, MeteringError> {
        match group_by {
            GroupBy::Agent | GroupBy::Consumer => {
                let column = match group_by {
                    GroupBy::Agent => "agent_id",
                    _ => "consumer_id",
                };
                let (where_sql, params) = Self::where_clause(filters);
                let sql = format!(
                    "SELECT {column}, SUM(tokens_in + tokens_out), COUNT(*), SUM(api_calls), \
                     SUM(duration_ms) FROM usage_events{where_sql} GROUP BY {column} \
                     ORDER BY {column} ASC"
                );
                let conn = self.conn.lock().expect("sqlite lock poisoned");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    Ok(UsageAggregate {
                        group: row.get::<_, String>(0)?,
                        total_tokens: row.get::<_, i64>(1)?.max(0) as u64,
                        total_tasks: row.get::<_, i64>(2)?.max(0) as u64,
                        total_api_calls: row.get::<_, i64>(3)?.max(0) as u64,
                        total_duration_ms: row.get::<_, i64>(4)?.max(0) as u64,
                    })
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            }
            // Calendar bucketing happens in Rust so the day/week key rules
            // stay identical across store implementations.
            GroupBy::Day | GroupBy::Week => {
                Ok(aggregate_events(group_by, &self.fetch(filters, false)?))
            }
        }
    }

    async fn summary(&self, filters: &MeteringQuery) -> Result<UsageSummary, MeteringError> {
        let (where_sql, params) = Self::where_clause(filters);
        let sql = format!(
            "SELECT COALESCE(SUM(tokens_in + tokens_out), 0), COUNT(*), \
             COALESCE(SUM(api_calls), 0), COALESCE(SUM(duration_ms), 0), \
             COUNT(DISTINCT agent_id), COUNT(DISTINCT consumer_id) \
             FROM usage_events{where_sql}"
        );
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let summary = conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
            Ok(UsageSummary {
                total_tokens: row.get::<_, i64>(0)?.max(0) as u64,
                total_tasks: row.get::<_, i64>(1)?.max(0) as u64,
                total_api_calls: row.get::<_, i64>(2)?.max(0) as u64,
                total_duration_ms: row.get::<_, i64>(3)?.max(0) as u64,
                unique_agents: row.get::<_, i64>(4)?.max(0) as u64,
                unique_consumers: row.get::<_, i64>(5)?.max(0) as u64,
            })
        })?;
        Ok(summary)
    }

    async fn stats(&self) -> Result<StorageStats, MeteringError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let (total_events, oldest) = conn.query_row(
            "SELECT COUNT(*), MIN(timestamp) FROM usage_events",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?.max(0) as u64,
                    row.get::<_, Option<String>>(1)?,
                ))
            },
        )?;
        let oldest_timestamp = match oldest {
            Some(raw) => Some(decode_ts(&raw)?),
            None => None,
        };
        Ok(StorageStats {
            total_events,
            oldest_timestamp,
            retention_ttl_seconds: self.retention.map(|d| d.as_secs()),
        })
    }

    async fn purge_expired(&self) -> Result<u64, MeteringError> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| MeteringError::Storage(e.to_string()))?;
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let removed = conn.execute(
            "DELETE FROM usage_events WHERE timestamp < ?1",
            rusqlite::params![encode_ts(cutoff)],
        )?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(ts: DateTime<Utc>, task: &str, agent: &str, consumer: &str) -> UsageEvent {
        UsageEvent {
            task_id: task.into(),
            agent_id: agent.into(),
            consumer_id: consumer.into(),
            metrics: UsageMetrics {
                tokens_in: 100,
                tokens_out: 200,
                duration_ms: 50,
                api_calls: 1,
            },
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn record_and_query_roundtrip() {
        let store = SqliteMeteringStore::open_in_memory().unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        store.record(event(ts, "t1", "a1", "c1")).await.unwrap();

        let out = store.query(&MeteringQuery::default()).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].task_id, "t1");
        assert_eq!(out[0].timestamp, ts);
        assert_eq!(out[0].metrics.tokens_out, 200);
    }

    #[tokio::test]
    async fn opens_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.db");
        {
            let store = SqliteMeteringStore::open(&path).unwrap();
            store.record(event(Utc::now(), "t1", "a", "c")).await.unwrap();
        }
        let reopened = SqliteMeteringStore::open(&path).unwrap();
        assert_eq!(reopened.stats().await.unwrap().total_events, 1);
    }

    #[tokio::test]
    async fn filters_and_half_open_range() {
        let store = SqliteMeteringStore::open_in_memory().unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        store.record(event(t1, "t1", "a1", "c1")).await.unwrap();
        store.record(event(t2, "t2", "a2", "c2")).await.unwrap();

        let ranged = store
            .query(&MeteringQuery {
                start: Some(t1),
                end: Some(t2),
                ..MeteringQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].task_id, "t1");

        let by_agent = store
            .query(&MeteringQuery {
                agent_id: Some("a2".into()),
                ..MeteringQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(by_agent.len(), 1);
        assert_eq!(by_agent[0].task_id, "t2");
    }

    #[tokio::test]
    async fn pagination_in_sql() {
        let store = SqliteMeteringStore::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            store
                .record(event(base + chrono::Duration::seconds(i), &format!("t{i}"), "a", "c"))
                .await
                .unwrap();
        }
        let page = store
            .query(&MeteringQuery {
                limit: Some(2),
                offset: Some(3),
                ..MeteringQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].task_id, "t3");
    }

    #[tokio::test]
    async fn aggregate_by_agent_uses_group_totals() {
        let store = SqliteMeteringStore::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        store.record(event(base, "t1", "a1", "c")).await.unwrap();
        store
            .record(event(base + chrono::Duration::seconds(1), "t2", "a1", "c"))
            .await
            .unwrap();
        store
            .record(event(base + chrono::Duration::seconds(2), "t3", "a2", "c"))
            .await
            .unwrap();

        let aggs = store
            .aggregate(GroupBy::Agent, &MeteringQuery::default())
            .await
            .unwrap();
        assert_eq!(aggs.len(), 2);
        assert_eq!(aggs[0].group, "a1");
        assert_eq!(aggs[0].total_tasks, 2);
        assert_eq!(aggs[0].total_tokens, 600);
    }

    #[tokio::test]
    async fn aggregate_by_week_matches_memory_semantics() {
        let store = SqliteMeteringStore::open_in_memory().unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        store.record(event(ts, "t1", "a", "c")).await.unwrap();
        let aggs = store
            .aggregate(GroupBy::Week, &MeteringQuery::default())
            .await
            .unwrap();
        assert_eq!(aggs.len(), 1);
        assert_eq!(aggs[0].group, "2026-W09");
    }

    #[tokio::test]
    async fn summary_counts_distinct() {
        let store = SqliteMeteringStore::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        store.record(event(base, "t1", "a1", "c1")).await.unwrap();
        store
            .record(event(base + chrono::Duration::seconds(1), "t2", "a2", "c1"))
            .await
            .unwrap();

        let summary = store.summary(&MeteringQuery::default()).await.unwrap();
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.unique_agents, 2);
        assert_eq!(summary.unique_consumers, 1);
    }

    #[tokio::test]
    async fn empty_summary_is_zeroed() {
        let store = SqliteMeteringStore::open_in_memory().unwrap();
        let summary = store.summary(&MeteringQuery::default()).await.unwrap();
        assert_eq!(summary, UsageSummary::default());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_events, 0);
        assert!(stats.oldest_timestamp.is_none());
    }

    #[tokio::test]
    async fn purge_deletes_by_cutoff() {
        let store = SqliteMeteringStore {
            retention: Some(Duration::from_secs(60)),
            conn: Mutex::new({
                let conn = Connection::open_in_memory().unwrap();
                conn.execute_batch(SCHEMA).unwrap();
                conn
            }),
        };
        store
            .record(event(Utc::now() - chrono::Duration::hours(2), "old", "a", "c"))
            .await
            .unwrap();
        store.record(event(Utc::now(), "new", "a", "c")).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        let left = store.query(&MeteringQuery::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].task_id, "new");
    }

    #[tokio::test]
    async fn purge_without_ttl_returns_zero() {
        let store = SqliteMeteringStore::open_in_memory().unwrap();
        store.record(event(Utc::now(), "t", "a", "c")).await.unwrap();
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }
}
