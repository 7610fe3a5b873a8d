// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task-lifecycle metering hook.

use crate::event::{UsageEvent, UsageMetrics};
use crate::store::{MeteringError, MeteringStore};
use asap_core::{Envelope, Manifest};
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

/// Coerce an agent-reported metric value to `u64`.
///
/// Accepts non-negative integers, floats (rounded), and numeric strings;
/// anything else falls back to 0.
#[must_use]
pub fn safe_u64(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                u
            } else if let Some(f) = n.as_f64() {
                if f.is_finite() && f > 0.0 { f.round() as u64 } else { 0 }
            } else {
                0
            }
        }
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(f) if f.is_finite() && f > 0.0 => f.round() as u64,
            _ => 0,
        },
        _ => 0,
    }
}

fn is_task_request(payload_type: &str) -> bool {
    matches!(payload_type, "task.request" | "TaskRequest")
}

fn is_task_response(payload_type: &str) -> bool {
    matches!(payload_type, "task.response" | "TaskResponse")
}

/// Record a [`UsageEvent`] for a completed request/response pair.
///
/// Records iff the request is a task request and the response a task
/// response with a `task_id`. Token and api-call counts come from the
/// response's `metrics` object (`tokens_out` falls back to `tokens_used`
/// when zero); the measured `duration_ms` is clamped at zero. Returns
/// whether an event was recorded.
///
/// # Errors
///
/// Propagates storage failures from the underlying store.
pub async fn record_task_usage(
    store: &dyn MeteringStore,
    request: &Envelope,
    response: &Envelope,
    duration_ms: i64,
    manifest: &Manifest,
) -> Result<bool, MeteringError> {
    if !is_task_request(request.payload_type()) || !is_task_response(response.payload_type()) {
        return Ok(false);
    }
    let Some(task_id) = response.payload().get("task_id").and_then(Value::as_str) else {
        debug!(envelope_id = response.id(), "task.response without task_id; usage not recorded");
        return Ok(false);
    };

    let metrics = response.payload().get("metrics");
    let get = |key: &str| metrics.and_then(|m| m.get(key));
    let tokens_in = safe_u64(get("tokens_in"));
    let mut tokens_out = safe_u64(get("tokens_out"));
    if tokens_out == 0 {
        tokens_out = safe_u64(get("tokens_used"));
    }

    let event = UsageEvent {
        task_id: task_id.to_string(),
        agent_id: manifest.id.as_str().to_string(),
        consumer_id: request.sender().as_str().to_string(),
        metrics: UsageMetrics {
            tokens_in,
            tokens_out,
            duration_ms: duration_ms.max(0) as u64,
            api_calls: safe_u64(get("api_calls")),
        },
        timestamp: Utc::now(),
    };
    store.record(event).await?;
    Ok(true)
}
