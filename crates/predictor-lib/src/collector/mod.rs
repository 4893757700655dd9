//! Metrics collection from the time-series backend
//!
//! The collector polls a Prometheus-compatible HTTP API for the recent
//! window of CPU, memory and request-rate series of the target workload.
//! Individual series may be missing; the whole poll fails only when the
//! backend itself is unreachable or too slow.

mod prometheus_source;

pub use prometheus_source::{PrometheusConfig, PrometheusSource, DEFAULT_FETCH_TIMEOUT};

use crate::error::Result;
use crate::models::{series, CollectedMetrics};

pub use async_trait::async_trait;

/// Trait for metrics backend implementations
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fetch the current sample window for every configured series
    async fn fetch_current_metrics(&self) -> Result<CollectedMetrics>;

    /// Check that the backend answers at all
    async fn probe(&self) -> Result<()>;

    /// Human-readable backend name used as the sample source label
    fn name(&self) -> &str;
}

/// A named query for one workload series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesQuery {
    pub name: String,
    pub promql: String,
}

impl SeriesQuery {
    pub fn new(name: impl Into<String>, promql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            promql: promql.into(),
        }
    }
}

/// Build the default PromQL set for a deployment in a namespace
pub fn workload_queries(namespace: &str, deployment: &str) -> Vec<SeriesQuery> {
    let pods = format!(r#"namespace="{namespace}", pod=~"{deployment}.*""#);
    vec![
        SeriesQuery::new(
            series::CPU_USAGE,
            format!("avg(rate(container_cpu_usage_seconds_total{{{pods}}}[5m])) * 100"),
        ),
        SeriesQuery::new(
            series::MEMORY_USAGE,
            format!("avg(container_memory_working_set_bytes{{{pods}}}) / 1024 / 1024"),
        ),
        SeriesQuery::new(
            series::REQUEST_RATE,
            format!("sum(rate(http_requests_total{{{pods}}}[5m]))"),
        ),
        SeriesQuery::new(
            series::QUEUE_LENGTH,
            format!(r#"avg(queue_size{{namespace="{namespace}", job="{deployment}"}})"#),
        ),
        SeriesQuery::new(
            series::RESPONSE_TIME,
            format!("avg(http_request_duration_seconds{{{pods}}})"),
        ),
        SeriesQuery::new(
            series::ACTIVE_CONNECTIONS,
            format!("sum(active_connections{{{pods}}})"),
        ),
    ]
}
