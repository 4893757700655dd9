//! Core data models for the pod predictor

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Workload series names queried from the metrics backend
pub mod series {
    pub const CPU_USAGE: &str = "cpu_usage";
    pub const MEMORY_USAGE: &str = "memory_usage";
    pub const REQUEST_RATE: &str = "request_rate";
    pub const QUEUE_LENGTH: &str = "queue_length";
    pub const RESPONSE_TIME: &str = "response_time";
    pub const ACTIVE_CONNECTIONS: &str = "active_connections";

    /// All known series in canonical order
    pub const ALL: [&str; 6] = [
        CPU_USAGE,
        MEMORY_USAGE,
        REQUEST_RATE,
        QUEUE_LENGTH,
        RESPONSE_TIME,
        ACTIVE_CONNECTIONS,
    ];
}

/// One observation of a workload signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub timestamp: i64,
    pub value: f64,
    pub source: String,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, timestamp: i64, value: f64, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value,
            source: source.into(),
        }
    }
}

/// Result of one poll of the metrics backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectedMetrics {
    pub samples: Vec<MetricSample>,
    /// Series that returned no data or failed individually
    pub missing: Vec<String>,
    pub fetched_at: i64,
}

impl CollectedMetrics {
    /// Number of samples recorded for a series
    pub fn series_len(&self, name: &str) -> usize {
        self.samples.iter().filter(|s| s.name == name).count()
    }

    /// Most recent value of every series present in the poll
    pub fn latest_values(&self) -> BTreeMap<String, f64> {
        let mut latest: BTreeMap<String, (i64, f64)> = BTreeMap::new();
        for sample in &self.samples {
            latest
                .entry(sample.name.clone())
                .and_modify(|(ts, value)| {
                    if sample.timestamp >= *ts {
                        *ts = sample.timestamp;
                        *value = sample.value;
                    }
                })
                .or_insert((sample.timestamp, sample.value));
        }
        latest.into_iter().map(|(k, (_, v))| (k, v)).collect()
    }
}

/// A single named feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: f64,
}

/// Fixed-shape numeric summary of the recent sample window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub features: Vec<Feature>,
    pub window_start: i64,
    pub window_end: i64,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.features
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Model output for one feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_pod_count: u32,
    pub confidence: f64,
    pub model_version: String,
    pub generated_at: i64,
}

impl Prediction {
    /// Age in seconds relative to `now`
    pub fn age_secs(&self, now: i64) -> i64 {
        (now - self.generated_at).max(0)
    }
}

/// Value surfaced to the external autoscaler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalerMetricReading {
    pub metric_name: String,
    pub metric_value: u32,
    pub timestamp: String,
    pub stale: bool,
    pub fallback: bool,
}
