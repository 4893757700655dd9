//! Latest-prediction cache
//!
//! Holds the last complete refresh result and, separately, the values of
//! the last successful fetch, each behind a reader-writer lock. The refresh
//! loop builds new values without a lock held and only swaps the `Arc`
//! under the write lock, so readers never wait on a fetch.

use crate::models::{CollectedMetrics, FeatureVector, Prediction};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Result of one successful refresh cycle
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub prediction: Prediction,
    pub features: FeatureVector,
    /// Latest value per series from the poll that produced the prediction
    pub metrics: BTreeMap<String, f64>,
    pub missing: Vec<String>,
    pub fetched_at: i64,
    #[serde(skip)]
    pub refresh_latency: Duration,
}

impl CacheEntry {
    /// Whether the prediction is older than `max_age` at `now`
    pub fn is_stale(&self, now: i64, max_age: Duration) -> bool {
        self.prediction.age_secs(now) > max_age.as_secs() as i64
    }
}

/// Latest per-series values of the last successful fetch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub values: BTreeMap<String, f64>,
    pub missing: Vec<String>,
    pub fetched_at: i64,
}

impl From<&CollectedMetrics> for MetricsSnapshot {
    fn from(collected: &CollectedMetrics) -> Self {
        Self {
            values: collected.latest_values(),
            missing: collected.missing.clone(),
            fetched_at: collected.fetched_at,
        }
    }
}

/// Shared handle to the latest prediction and fetch snapshot
#[derive(Debug, Clone, Default)]
pub struct PredictionCache {
    latest: Arc<RwLock<Option<Arc<CacheEntry>>>>,
    snapshot: Arc<RwLock<Option<Arc<MetricsSnapshot>>>>,
}

impl PredictionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest complete entry, if any refresh has succeeded yet
    pub async fn latest(&self) -> Option<Arc<CacheEntry>> {
        self.latest.read().await.clone()
    }

    /// Values of the last successful fetch, even when it produced no prediction
    pub async fn latest_metrics(&self) -> Option<Arc<MetricsSnapshot>> {
        self.snapshot.read().await.clone()
    }

    /// Replace the cached entry; only the refresh loop calls this
    pub(crate) async fn publish(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        *self.latest.write().await = Some(entry.clone());
        entry
    }

    /// Replace the fetch snapshot; only the refresh loop calls this
    pub(crate) async fn publish_metrics(&self, snapshot: MetricsSnapshot) {
        *self.snapshot.write().await = Some(Arc::new(snapshot));
    }
}
