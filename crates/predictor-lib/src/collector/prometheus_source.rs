//! Prometheus HTTP API client
//!
//! Runs one range query per series concurrently and merges the results
//! into a flat sample list. The whole poll is bounded by a single timeout.

use super::{async_trait, workload_queries, MetricsSource, SeriesQuery};
use crate::error::{PredictorError, Result};
use crate::models::{CollectedMetrics, MetricSample};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

/// Default bound on a full poll of the backend
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

const SOURCE_LABEL: &str = "prometheus";

/// Configuration for the Prometheus source
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Base URL, e.g. "http://prometheus:9090" or "https://host/prometheus"
    pub url: String,
    pub namespace: String,
    pub deployment: String,
    /// How far back each range query looks
    pub window: Duration,
    /// Range query resolution
    pub step: Duration,
    /// Bound on a full poll
    pub timeout: Duration,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            namespace: "default".to_string(),
            deployment: "app".to_string(),
            window: Duration::from_secs(10 * 60),
            step: Duration::from_secs(30),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<SeriesResult>,
}

#[derive(Debug, Deserialize)]
struct SeriesResult {
    #[serde(default)]
    values: Vec<(f64, String)>,
    #[serde(default)]
    value: Option<(f64, String)>,
}

/// Why a single series query produced no samples
#[derive(Debug)]
enum QueryFailure {
    /// Connection refused, DNS, TLS, per-request timeout
    Transport(String),
    /// Backend answered 5xx, `status: "error"` or an unusable payload
    Unavailable(String),
    /// Backend refused this query (4xx); the series is missing
    Rejected(String),
}

/// Metrics source backed by the Prometheus HTTP API
pub struct PrometheusSource {
    client: Client,
    base_url: Url,
    queries: Vec<SeriesQuery>,
    config: PrometheusConfig,
}

impl PrometheusSource {
    /// Create a source with the default workload query set
    pub fn new(config: PrometheusConfig) -> Result<Self> {
        let queries = workload_queries(&config.namespace, &config.deployment);
        Self::with_queries(config, queries)
    }

    /// Create a source with a custom query set
    pub fn with_queries(config: PrometheusConfig, queries: Vec<SeriesQuery>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PredictorError::backend_unavailable(format!("http client: {e}")))?;

        // Url::join drops the last path segment unless the base ends in '/'
        let mut raw = config.url.trim_end_matches('/').to_string();
        raw.push('/');
        let base_url = Url::parse(&raw).map_err(|e| {
            PredictorError::backend_unavailable(format!("invalid backend url '{}': {e}", config.url))
        })?;

        Ok(Self {
            client,
            base_url,
            queries,
            config,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn queries(&self) -> &[SeriesQuery] {
        &self.queries
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| PredictorError::backend_unavailable(format!("invalid path {path}: {e}")))
    }

    async fn query_range(
        client: Client,
        url: Url,
        promql: String,
        start: i64,
        end: i64,
        step_secs: u64,
    ) -> std::result::Result<Vec<(i64, f64)>, QueryFailure> {
        let (start, end, step) = (start.to_string(), end.to_string(), step_secs.to_string());
        let response = client
            .get(url)
            .query(&[
                ("query", promql.as_str()),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("step", step.as_str()),
            ])
            .send()
            .await
            .map_err(|e| QueryFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = format!("HTTP {status}: {body}");
            return Err(if status.is_client_error() {
                QueryFailure::Rejected(reason)
            } else {
                QueryFailure::Unavailable(reason)
            });
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| QueryFailure::Unavailable(format!("invalid response body: {e}")))?;

        if parsed.status != "success" {
            return Err(QueryFailure::Unavailable(
                parsed.error.unwrap_or_else(|| format!("status {}", parsed.status)),
            ));
        }

        let results = parsed.data.map(|d| d.result).unwrap_or_default();
        Ok(merge_series(&results))
    }
}

/// Merge every result series into one point list, averaging per timestamp
fn merge_series(results: &[SeriesResult]) -> Vec<(i64, f64)> {
    let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for result in results {
        let points = result.values.iter().chain(result.value.iter());
        for (ts, raw) in points {
            let value = match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => v,
                _ => continue,
            };
            let bucket = buckets.entry(ts.floor() as i64).or_insert((0.0, 0));
            bucket.0 += value;
            bucket.1 += 1;
        }
    }
    buckets
        .into_iter()
        .map(|(ts, (sum, count))| (ts, sum / count as f64))
        .collect()
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    async fn fetch_current_metrics(&self) -> Result<CollectedMetrics> {
        let end = chrono::Utc::now().timestamp();
        let start = end - self.config.window.as_secs() as i64;
        let step_secs = self.config.step.as_secs().max(1);
        let url = self.endpoint("api/v1/query_range")?;

        let mut tasks = JoinSet::new();
        for query in &self.queries {
            let name = query.name.clone();
            let fut = Self::query_range(
                self.client.clone(),
                url.clone(),
                query.promql.clone(),
                start,
                end,
                step_secs,
            );
            tasks.spawn(async move { (name, fut.await) });
        }

        let gathered = tokio::time::timeout(self.config.timeout, async {
            let mut out = Vec::with_capacity(tasks.len());
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => out.push(result),
                    Err(e) => warn!(error = %e, "Series query task failed"),
                }
            }
            out
        })
        .await
        .map_err(|_| {
            PredictorError::backend_unavailable(format!(
                "fetch exceeded {}ms timeout",
                self.config.timeout.as_millis()
            ))
        })?;

        let mut metrics = CollectedMetrics {
            fetched_at: end,
            ..Default::default()
        };
        // Queries that failed because the backend itself is not serving
        let mut backend_errors = Vec::new();

        for (name, result) in gathered {
            match result {
                Ok(points) if !points.is_empty() => {
                    metrics.samples.extend(
                        points
                            .into_iter()
                            .map(|(ts, v)| MetricSample::new(name.clone(), ts, v, SOURCE_LABEL)),
                    );
                }
                Ok(_) => {
                    debug!(series = %name, "Series returned no data");
                    metrics.missing.push(name);
                }
                Err(QueryFailure::Rejected(reason)) => {
                    warn!(component = "collector", series = %name, error = %reason, "Series query rejected");
                    metrics.missing.push(name);
                }
                Err(QueryFailure::Unavailable(reason) | QueryFailure::Transport(reason)) => {
                    warn!(component = "collector", series = %name, error = %reason, "Series query failed");
                    backend_errors.push(reason);
                    metrics.missing.push(name);
                }
            }
        }

        if !self.queries.is_empty() && backend_errors.len() == self.queries.len() {
            return Err(PredictorError::backend_unavailable(
                backend_errors.swap_remove(0),
            ));
        }

        metrics.missing.sort();
        Ok(metrics)
    }

    async fn probe(&self) -> Result<()> {
        let url = self.endpoint("api/v1/query")?;
        let response = self
            .client
            .get(url)
            .query(&[("query", "up")])
            .send()
            .await
            .map_err(|e| PredictorError::backend_unavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(PredictorError::backend_unavailable(format!(
                "probe returned HTTP {}",
                response.status()
            )))
        }
    }

    fn name(&self) -> &str {
        SOURCE_LABEL
    }
}
