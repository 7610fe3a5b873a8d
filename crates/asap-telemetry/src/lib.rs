// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Counter / histogram collection for the ASAP transport runtime, plus
//! OpenMetrics text rendering for the `/asap/metrics` endpoint.
//!
//! A process-wide collector is available through [`global`]; tests build
//! their own [`MetricsCollector`] instances to observe in isolation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, OnceLock};

/// Label set attached to a metric sample (deterministic ordering).
pub type Labels = BTreeMap<String, String>;

/// Bucket a `payload_type` label against a fixed allowlist.
///
/// Anything outside `known` is collapsed into the literal `"other"` so
/// per-request counters never grow an unbounded label space.
#[must_use]
pub fn bounded_label<'a>(value: &'a str, known: &[&str]) -> &'a str {
    if known.contains(&value) { value } else { "other" }
}

/// Convenience constructor for a label map.
///
/// # Examples
///
/// ```
/// use asap_telemetry::labels;
///
/// let l = labels(&[("status", "success")]);
/// assert_eq!(l["status"], "success");
/// ```
#[must_use]
pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SampleKey {
    name: String,
    labels: Labels,
}

/// One counter value in a [`MetricsSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSample {
    /// Metric name.
    pub name: String,
    /// Label set.
    pub labels: Labels,
    /// Current value.
    pub value: u64,
}

/// One histogram value in a [`MetricsSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSample {
    /// Metric name.
    pub name: String,
    /// Label set.
    pub labels: Labels,
    /// Observation count.
    pub count: u64,
    /// Sum of observations.
    pub sum: f64,
}

/// Point-in-time export of every recorded sample, in deterministic
/// order. Serializable for JSON export and assertions in tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// All counters.
    pub counters: Vec<CounterSample>,
    /// All histograms.
    pub histograms: Vec<HistogramSample>,
}

#[derive(Debug, Clone, Default)]
struct HistogramData {
    count: u64,
    sum: f64,
}

#[derive(Debug, Default)]
struct Inner {
    counters: BTreeMap<SampleKey, u64>,
    histograms: BTreeMap<SampleKey, HistogramData>,
}

/// Thread-safe counter / histogram collector.
///
/// Clone freely; all clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Inner>>,
}

impl MetricsCollector {
    /// Create a new, empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add 1 to the counter identified by `name` + `labels`.
    pub fn increment_counter(&self, name: &str, labels: Labels) {
        self.add_to_counter(name, labels, 1);
    }

    /// Add `delta` to the counter identified by `name` + `labels`.
    pub fn add_to_counter(&self, name: &str, labels: Labels, delta: u64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        *inner
            .counters
            .entry(SampleKey {
                name: name.to_string(),
                labels,
            })
            .or_insert(0) += delta;
    }

    /// Record one observation into the histogram `name` + `labels`.
    pub fn observe_histogram(&self, name: &str, value: f64, labels: Labels) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        let data = inner
            .histograms
            .entry(SampleKey {
                name: name.to_string(),
                labels,
            })
            .or_default();
        data.count += 1;
        data.sum += value;
    }

    /// Current value of a counter, or 0 when never incremented.
    #[must_use]
    pub fn counter_value(&self, name: &str, labels: &Labels) -> u64 {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .counters
            .get(&SampleKey {
                name: name.to_string(),
                labels: labels.clone(),
            })
            .copied()
            .unwrap_or(0)
    }

    /// Observation count of a histogram, or 0 when never observed.
    #[must_use]
    pub fn histogram_count(&self, name: &str, labels: &Labels) -> u64 {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .histograms
            .get(&SampleKey {
                name: name.to_string(),
                labels: labels.clone(),
            })
            .map(|h| h.count)
            .unwrap_or(0)
    }

    /// Export every sample as a [`MetricsSnapshot`].
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        MetricsSnapshot {
            counters: inner
                .counters
                .iter()
                .map(|(key, value)| CounterSample {
                    name: key.name.clone(),
                    labels: key.labels.clone(),
                    value: *value,
                })
                .collect(),
            histograms: inner
                .histograms
                .iter()
                .map(|(key, data)| HistogramSample {
                    name: key.name.clone(),
                    labels: key.labels.clone(),
                    count: data.count,
                    sum: data.sum,
                })
                .collect(),
        }
    }

    /// Drop every recorded sample.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.counters.clear();
        inner.histograms.clear();
    }

    /// Render every sample in OpenMetrics text exposition format.
    ///
    /// Counters render as `name{labels} value`; histograms render their
    /// `_count` and `_sum` series. Output ordering is deterministic.
    #[must_use]
    pub fn render_text(&self) -> String {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let mut out = String::new();
        let mut last_name: Option<&str> = None;

        for (key, value) in &inner.counters {
            if last_name != Some(key.name.as_str()) {
                let _ = writeln!(out, "# TYPE {} counter", key.name);
                last_name = Some(key.name.as_str());
            }
            let _ = writeln!(out, "{}{} {}", key.name, render_labels(&key.labels), value);
        }

        last_name = None;
        for (key, data) in &inner.histograms {
            if last_name != Some(key.name.as_str()) {
                let _ = writeln!(out, "# TYPE {} histogram", key.name);
                last_name = Some(key.name.as_str());
            }
            let labels = render_labels(&key.labels);
            let _ = writeln!(out, "{}_count{} {}", key.name, labels, data.count);
            let _ = writeln!(out, "{}_sum{} {}", key.name, labels, data.sum);
        }
        out
    }
}

fn render_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let body = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{body}}}")
}

static GLOBAL: OnceLock<MetricsCollector> = OnceLock::new();

/// Process-wide metrics collector used by client and server.
pub fn global() -> &'static MetricsCollector {
    GLOBAL.get_or_init(MetricsCollector::new)
}
