//! HTTP API serving cached predictions, health and Prometheus metrics

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use predictor_lib::{
    cache::{CacheEntry, PredictionCache},
    collector::MetricsSource,
    error::PredictorError,
    health::HealthRegistry,
    models::{series, FeatureVector, ScalerMetricReading},
    observability::PredictorMetrics,
    refresh::RefreshHandle,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name under which the external autoscaler reads the prediction
pub const SCALER_METRIC_NAME: &str = "predicted_pod_count";

const ENDPOINTS: &[&str] = &[
    "/health",
    "/predict-from-prometheus",
    "/keda-metric",
    "/current-metrics",
    "/prometheus-metrics",
];

/// Static facts about the running service
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub prometheus_url: String,
    pub target_namespace: String,
    pub target_deployment: String,
    pub model_version: String,
    pub expected_features: Vec<String>,
    /// Prediction age beyond which views report `stale: true`
    pub stale_after: Duration,
    pub refresh_wait: Duration,
    pub min_replicas: u32,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub info: ServiceInfo,
    pub cache: PredictionCache,
    pub health: HealthRegistry,
    pub metrics: PredictorMetrics,
    pub refresh: RefreshHandle,
    pub source: Arc<dyn MetricsSource>,
}

/// Error body returned by every route
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Errors surfaced to HTTP clients
#[derive(Debug)]
pub enum ApiError {
    Predictor(PredictorError),
    /// Nothing cached yet
    NotReady(String),
    Internal(String),
}

impl From<PredictorError> for ApiError {
    fn from(err: PredictorError) -> Self {
        ApiError::Predictor(err)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Predictor(PredictorError::MalformedRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, code, details) = match self {
            ApiError::Predictor(err) => {
                let status = match &err {
                    PredictorError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
                    PredictorError::BackendUnavailable { .. }
                    | PredictorError::InsufficientData { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    PredictorError::ModelLoadFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let title = match &err {
                    PredictorError::MalformedRequest(_) => "Malformed request",
                    PredictorError::BackendUnavailable { .. } => "Metrics backend unavailable",
                    PredictorError::InsufficientData { .. } => "Insufficient data",
                    PredictorError::ModelLoadFailure { .. } => "Model unavailable",
                };
                (status, title.to_string(), err.code(), Some(err.to_string()))
            }
            ApiError::NotReady(details) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No prediction available yet".to_string(),
                "not_ready",
                Some(details),
            ),
            ApiError::Internal(details) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
                "internal",
                Some(details),
            ),
        };

        let body = ErrorBody {
            error,
            code: code.to_string(),
            details,
        };
        (status, Json(body)).into_response()
    }
}

/// Query string accepted by routes that take no parameters
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoParams {}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictParams {
    #[serde(default)]
    pub include_features: bool,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RootResponse {
    pub message: String,
    pub version: String,
    pub prometheus_url: String,
    pub prometheus_connected: bool,
    pub target_namespace: String,
    pub target_deployment: String,
    pub model_version: String,
    pub expected_features: usize,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentMetricsResponse {
    /// Latest value per series; null when the series returned no data
    pub metrics: BTreeMap<String, Option<f64>>,
    pub missing: Vec<String>,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub predicted_pod_count: u32,
    pub confidence: f64,
    pub model_version: String,
    pub timestamp: String,
    pub stale: bool,
    pub metrics_used: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureVector>,
    /// Set when an on-demand refresh failed and the cached prediction is served
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_error: Option<String>,
}

fn rfc3339(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl AppState {
    fn is_stale(&self, entry: &CacheEntry) -> bool {
        entry.is_stale(now(), self.info.stale_after)
    }
}

async fn root(
    State(state): State<Arc<AppState>>,
    params: Result<Query<NoParams>, QueryRejection>,
) -> Result<Json<RootResponse>, ApiError> {
    params?;
    let prometheus_connected = state.source.probe().await.is_ok();

    Ok(Json(RootResponse {
        message: "Kubernetes Pod Autoscaling Predictor with Prometheus Integration".to_string(),
        version: SERVICE_VERSION.to_string(),
        prometheus_url: state.info.prometheus_url.clone(),
        prometheus_connected,
        target_namespace: state.info.target_namespace.clone(),
        target_deployment: state.info.target_deployment.clone(),
        model_version: state.info.model_version.clone(),
        expected_features: state.info.expected_features.len(),
        endpoints: ENDPOINTS.iter().map(|s| s.to_string()).collect(),
    }))
}

/// Readiness: 200 when the model is loaded and the last fetch is recent, 503 otherwise
async fn health(
    State(state): State<Arc<AppState>>,
    params: Result<Query<NoParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    params?;
    let health = state.health.health().await;

    let status_code = if health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((status_code, Json(health)).into_response())
}

async fn current_metrics(
    State(state): State<Arc<AppState>>,
    params: Result<Query<NoParams>, QueryRejection>,
) -> Result<Json<CurrentMetricsResponse>, ApiError> {
    params?;
    let snapshot = state
        .cache
        .latest_metrics()
        .await
        .ok_or_else(|| ApiError::NotReady("no successful metrics fetch yet".to_string()))?;

    let metrics = series::ALL
        .iter()
        .map(|name| (name.to_string(), snapshot.values.get(*name).copied()))
        .collect();

    Ok(Json(CurrentMetricsResponse {
        metrics,
        missing: snapshot.missing.clone(),
        timestamp: rfc3339(snapshot.fetched_at),
    }))
}

async fn predict_from_prometheus(
    State(state): State<Arc<AppState>>,
    params: Result<Query<PredictParams>, QueryRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let Query(params) = params?;

    let (entry, refresh_error) = if params.refresh {
        match state.refresh.refresh_now(state.info.refresh_wait).await {
            Ok(entry) => (Some(entry), None),
            Err(err) => {
                warn!(component = "api", error = %err, "On-demand refresh failed, serving cached prediction");
                (state.cache.latest().await, Some(err))
            }
        }
    } else {
        (state.cache.latest().await, None)
    };

    let entry = match (entry, &refresh_error) {
        (Some(entry), _) => entry,
        (None, Some(err)) => return Err(err.clone().into()),
        (None, None) => {
            return Err(ApiError::NotReady(
                "the first refresh cycle has not completed".to_string(),
            ))
        }
    };

    let prediction = &entry.prediction;
    Ok(Json(PredictionResponse {
        predicted_pod_count: prediction.predicted_pod_count,
        confidence: prediction.confidence,
        model_version: prediction.model_version.clone(),
        timestamp: rfc3339(prediction.generated_at),
        stale: state.is_stale(&entry),
        metrics_used: entry.metrics.clone(),
        features: params.include_features.then(|| entry.features.clone()),
        refresh_error: refresh_error.map(|e| e.to_string()),
    }))
}

/// External metric for the autoscaler; always answers with one number
async fn keda_metric(
    State(state): State<Arc<AppState>>,
    params: Result<Query<NoParams>, QueryRejection>,
) -> Result<Json<ScalerMetricReading>, ApiError> {
    params?;

    let reading = match state.cache.latest().await {
        Some(entry) => ScalerMetricReading {
            metric_name: SCALER_METRIC_NAME.to_string(),
            metric_value: entry.prediction.predicted_pod_count,
            timestamp: rfc3339(entry.prediction.generated_at),
            stale: state.is_stale(&entry),
            fallback: false,
        },
        None => ScalerMetricReading {
            metric_name: SCALER_METRIC_NAME.to_string(),
            metric_value: state.info.min_replicas,
            timestamp: rfc3339(now()),
            stale: true,
            fallback: true,
        },
    };

    Ok(Json(reading))
}

async fn prometheus_metrics(
    State(state): State<Arc<AppState>>,
    params: Result<Query<NoParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    params?;

    if let Some(entry) = state.cache.latest().await {
        state.metrics.set_stale(state.is_stale(&entry));
    }

    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, state.metrics.content_type())],
        body,
    )
        .into_response())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/current-metrics", get(current_metrics))
        .route("/predict-from-prometheus", get(predict_from_prometheus))
        .route("/keda-metric", get(keda_metric))
        .route("/prometheus-metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = %listener.local_addr()?, "Starting API server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
