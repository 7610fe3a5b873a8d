// SPDX-License-Identifier: MIT OR Apache-2.0
//! Read/write HTTP surface over the metering store.
//!
//! Mounted by [`crate::build_app`] only when a store is configured;
//! every handler still answers 503 when the store dependency is
//! missing so partially wired deployments fail loudly instead of 500ing.

use crate::AppState;
use asap_metering::{
    GroupBy, MeteringQuery, MeteringStore, UsageEvent, UsageMetrics,
};
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

/// Wire shape of one event on the REST surface (metrics flattened).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatUsageEvent {
    task_id: String,
    agent_id: String,
    consumer_id: String,
    #[serde(default)]
    tokens_in: u64,
    #[serde(default)]
    tokens_out: u64,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    api_calls: u64,
    timestamp: DateTime<Utc>,
}

impl From<UsageEvent> for FlatUsageEvent {
    fn from(event: UsageEvent) -> Self {
        Self {
            task_id: event.task_id,
            agent_id: event.agent_id,
            consumer_id: event.consumer_id,
            tokens_in: event.metrics.tokens_in,
            tokens_out: event.metrics.tokens_out,
            duration_ms: event.metrics.duration_ms,
            api_calls: event.metrics.api_calls,
            timestamp: event.timestamp,
        }
    }
}

impl From<FlatUsageEvent> for UsageEvent {
    fn from(flat: FlatUsageEvent) -> Self {
        Self {
            task_id: flat.task_id,
            agent_id: flat.agent_id,
            consumer_id: flat.consumer_id,
            metrics: UsageMetrics {
                tokens_in: flat.tokens_in,
                tokens_out: flat.tokens_out,
                duration_ms: flat.duration_ms,
                api_calls: flat.api_calls,
            },
            timestamp: flat.timestamp,
        }
    }
}

/// Query parameters accepted by the read endpoints.
#[derive(Debug, Default, Deserialize)]
struct UsageParams {
    agent_id: Option<String>,
    consumer_id: Option<String>,
    task_id: Option<String>,
    start: Option<String>,
    end: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    group_by: Option<String>,
    export_format: Option<String>,
}

enum UsageFault {
    BadRequest(String),
    StoreMissing,
    Storage(String),
}

impl IntoResponse for UsageFault {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": message })),
            )
                .into_response(),
            Self::StoreMissing => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "metering store not configured" })),
            )
                .into_response(),
            Self::Storage(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
                .into_response(),
        }
    }
}

fn store_of(state: &AppState) -> Result<&Arc<dyn MeteringStore>, UsageFault> {
    state.metering.as_ref().ok_or(UsageFault::StoreMissing)
}

fn parse_instant(field: &str, raw: &Option<String>) -> Result<Option<DateTime<Utc>>, UsageFault> {
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| UsageFault::BadRequest(format!("invalid {field} timestamp: {e}"))),
    }
}

fn to_query(params: &UsageParams) -> Result<MeteringQuery, UsageFault> {
    Ok(MeteringQuery {
        agent_id: params.agent_id.clone(),
        consumer_id: params.consumer_id.clone(),
        task_id: params.task_id.clone(),
        start: parse_instant("start", &params.start)?,
        end: parse_instant("end", &params.end)?,
        limit: params.limit,
        offset: params.offset,
    })
}

fn storage_err(err: asap_metering::MeteringError) -> UsageFault {
    UsageFault::Storage(err.to_string())
}

async fn list_usage(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageParams>,
) -> Result<Json<Value>, UsageFault> {
    let store = store_of(&state)?;
    let query = to_query(&params)?;
    let events = store.query(&query).await.map_err(storage_err)?;
    let data: Vec<FlatUsageEvent> = events.into_iter().map(Into::into).collect();
    let count = data.len();
    Ok(Json(json!({ "data": data, "count": count })))
}

async fn aggregate_usage(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageParams>,
) -> Result<Json<Value>, UsageFault> {
    let store = store_of(&state)?;
    let group_by_raw = params.group_by.clone().unwrap_or_else(|| "agent".to_string());
    let group_by = GroupBy::from_str(&group_by_raw)
        .map_err(|_| UsageFault::BadRequest(format!("unknown group_by value {group_by_raw:?}")))?;
    let query = to_query(&params)?;
    let aggregates = store.aggregate(group_by, &query).await.map_err(storage_err)?;
    Ok(Json(json!({ "group_by": group_by_raw, "data": aggregates })))
}

async fn summarize_usage(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageParams>,
) -> Result<Json<Value>, UsageFault> {
    let store = store_of(&state)?;
    let query = to_query(&params)?;
    let summary = store.summary(&query).await.map_err(storage_err)?;
    Ok(Json(serde_json::to_value(summary).unwrap_or_default()))
}

async fn distinct_listing(
    state: &AppState,
    params: &UsageParams,
    group_by: GroupBy,
    key: &str,
) -> Result<Json<Value>, UsageFault> {
    let store = store_of(state)?;
    let query = to_query(params)?;
    let aggregates = store.aggregate(group_by, &query).await.map_err(storage_err)?;
    let data: Vec<Value> = aggregates
        .into_iter()
        .map(|agg| {
            json!({
                key: agg.group,
                "total_tokens": agg.total_tokens,
                "total_tasks": agg.total_tasks,
                "total_api_calls": agg.total_api_calls,
                "total_duration_ms": agg.total_duration_ms,
            })
        })
        .collect();
    let count = data.len();
    Ok(Json(json!({ "data": data, "count": count })))
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageParams>,
) -> Result<Json<Value>, UsageFault> {
    distinct_listing(&state, &params, GroupBy::Agent, "agent_id").await
}

async fn list_consumers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageParams>,
) -> Result<Json<Value>, UsageFault> {
    distinct_listing(&state, &params, GroupBy::Consumer, "consumer_id").await
}

async fn usage_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, UsageFault> {
    let store = store_of(&state)?;
    let stats = store.stats().await.map_err(storage_err)?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

async fn export_usage(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageParams>,
) -> Result<Response, UsageFault> {
    let store = store_of(&state)?;
    let query = to_query(&params)?;
    let events = store.query(&query).await.map_err(storage_err)?;
    let data: Vec<FlatUsageEvent> = events.into_iter().map(Into::into).collect();

    match params.export_format.as_deref().unwrap_or("json") {
        "json" => Ok(Json(json!({ "data": data })).into_response()),
        "csv" => {
            let mut out = String::from(
                "task_id,agent_id,consumer_id,tokens_in,tokens_out,duration_ms,api_calls,timestamp\n",
            );
            for event in &data {
                let _ = writeln!(
                    out,
                    "{},{},{},{},{},{},{},{}",
                    event.task_id,
                    event.agent_id,
                    event.consumer_id,
                    event.tokens_in,
                    event.tokens_out,
                    event.duration_ms,
                    event.api_calls,
                    event.timestamp.to_rfc3339(),
                );
            }
            Ok(([(CONTENT_TYPE, "text/csv; charset=utf-8")], out).into_response())
        }
        other => Err(UsageFault::BadRequest(format!(
            "unknown export_format {other:?}; expected json or csv"
        ))),
    }
}

async fn record_usage(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Response, UsageFault> {
    let store = store_of(&state)?;
    let flat: FlatUsageEvent = serde_json::from_value(body)
        .map_err(|e| UsageFault::BadRequest(format!("invalid usage event: {e}")))?;
    let task_id = flat.task_id.clone();
    store.record(flat.into()).await.map_err(storage_err)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "recorded", "task_id": task_id })),
    )
        .into_response())
}

async fn record_usage_batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Response, UsageFault> {
    let store = store_of(&state)?;
    let events = body
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| UsageFault::BadRequest("body must carry an events array".into()))?;
    if events.is_empty() {
        return Err(UsageFault::BadRequest("events array must not be empty".into()));
    }

    let mut parsed: Vec<FlatUsageEvent> = Vec::with_capacity(events.len());
    for (index, event) in events.iter().enumerate() {
        parsed.push(
            serde_json::from_value(event.clone()).map_err(|e| {
                UsageFault::BadRequest(format!("invalid usage event at index {index}: {e}"))
            })?,
        );
    }

    let task_ids: Vec<String> = parsed.iter().map(|e| e.task_id.clone()).collect();
    for event in parsed {
        store.record(event.into()).await.map_err(storage_err)?;
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "recorded", "count": task_ids.len(), "task_ids": task_ids })),
    )
        .into_response())
}

async fn validate_usage(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, UsageFault> {
    // Validation requires the surface to be live, not the store itself.
    store_of(&state)?;
    match serde_json::from_value::<FlatUsageEvent>(body) {
        Ok(event) => Ok(Json(json!({
            "valid": true,
            "task_id": event.task_id,
            "agent_id": event.agent_id,
        }))),
        Err(err) => Ok(Json(json!({ "valid": false, "error": err.to_string() }))),
    }
}

async fn purge_usage(State(state): State<Arc<AppState>>) -> Result<Json<Value>, UsageFault> {
    let store = store_of(&state)?;
    let removed = store.purge_expired().await.map_err(storage_err)?;
    Ok(Json(json!({ "status": "purged", "removed": removed })))
}

/// Routes for the `/usage` surface.
pub(crate) fn usage_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/usage", get(list_usage).post(record_usage))
        .route("/usage/aggregate", get(aggregate_usage))
        .route("/usage/summary", get(summarize_usage))
        .route("/usage/agents", get(list_agents))
        .route("/usage/consumers", get(list_consumers))
        .route("/usage/stats", get(usage_stats))
        .route("/usage/export", get(export_usage))
        .route("/usage/batch", post(record_usage_batch))
        .route("/usage/validate", post(validate_usage))
        .route("/usage/purge", post(purge_usage))
}
