//! Integration tests for the predictor API endpoints

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use pod_predictor::api::{
    create_router, AppState, CurrentMetricsResponse, ErrorBody, PredictionResponse,
    RootResponse, ServiceInfo,
};
use predictor_lib::{
    cache::PredictionCache,
    collector::{async_trait, MetricsSource},
    error::{PredictorError, Result},
    health::{HealthRegistry, HealthResponse, Readiness},
    models::{series, CollectedMetrics, MetricSample, ScalerMetricReading},
    observability::{PredictorMetrics, StructuredLogger},
    predictor::{FeatureBuilder, FeatureConfig, ModelArtifact, PredictorConfig, ReplicaPredictor},
    refresh::{RefreshConfig, RefreshLoop},
};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tower::ServiceExt;

/// Metrics source replaying scripted polls
struct ScriptedSource {
    responses: Mutex<VecDeque<Result<CollectedMetrics>>>,
    reachable: bool,
}

#[async_trait]
impl MetricsSource for ScriptedSource {
    async fn fetch_current_metrics(&self) -> Result<CollectedMetrics> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PredictorError::backend_unavailable("script exhausted")))
    }

    async fn probe(&self) -> Result<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(PredictorError::backend_unavailable("connection refused"))
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// `samples` points per series at a 30s step, ending now
fn window(samples: usize, cpu: f64, memory: f64, rate: Option<f64>) -> CollectedMetrics {
    let now = chrono::Utc::now().timestamp();
    let mut out = Vec::new();
    for i in 0..samples {
        let ts = now - 30 * (samples - 1 - i) as i64;
        out.push(MetricSample::new(series::CPU_USAGE, ts, cpu, "scripted"));
        out.push(MetricSample::new(series::MEMORY_USAGE, ts, memory, "scripted"));
        if let Some(rate) = rate {
            out.push(MetricSample::new(series::REQUEST_RATE, ts, rate, "scripted"));
        }
    }
    let missing = if rate.is_some() {
        vec![]
    } else {
        vec![series::REQUEST_RATE.to_string()]
    };
    CollectedMetrics {
        samples: out,
        missing,
        fetched_at: now,
    }
}

/// Linear model: 1 + 0.05 * cpu + 0.02 * request_rate
fn write_linear_model(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("model.json");
    std::fs::write(
        &path,
        r#"{"intercept": 1.0, "coefficients": {"cpu_usage": 0.05, "request_rate": 0.02}, "version": "linear-test"}"#,
    )
    .unwrap();
    path
}

struct TestApp {
    router: Router,
    worker: RefreshLoop,
    _dir: tempfile::TempDir,
}

async fn setup(responses: Vec<Result<CollectedMetrics>>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let model_path = write_linear_model(dir.path());
    let artifact = ModelArtifact::load(&model_path, None).unwrap();
    let expected_features = artifact.feature_names().to_vec();
    let model_version = artifact.version().to_string();

    let source: Arc<dyn MetricsSource> = Arc::new(ScriptedSource {
        responses: Mutex::new(responses.into()),
        reachable: true,
    });
    let cache = PredictionCache::new();
    let health = HealthRegistry::new(Duration::from_secs(60));
    health.set_model_loaded(true).await;
    let metrics = PredictorMetrics::new();

    let (worker, handle) = RefreshLoop::new(
        source.clone(),
        FeatureBuilder::new(FeatureConfig::default()),
        Arc::new(ReplicaPredictor::new(artifact, PredictorConfig::default())),
        cache.clone(),
        health.clone(),
        metrics.clone(),
        StructuredLogger::new("default", "app"),
        RefreshConfig::default(),
    );
    worker.register_components().await;

    let state = Arc::new(AppState {
        info: ServiceInfo {
            prometheus_url: "http://prometheus:9090".to_string(),
            target_namespace: "default".to_string(),
            target_deployment: "app".to_string(),
            model_version,
            expected_features,
            stale_after: Duration::from_secs(35),
            refresh_wait: Duration::from_secs(5),
            min_replicas: 1,
        },
        cache,
        health,
        metrics,
        refresh: handle,
        source,
    });

    TestApp {
        router: create_router(state),
        worker,
        _dir: dir,
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, axum::response::Response) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    (response.status(), response)
}

async fn get_json<T: DeserializeOwned>(router: &Router, uri: &str) -> (StatusCode, T) {
    let (status, response) = get(router, uri).await;
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_root_describes_service() {
    let app = setup(vec![]).await;
    let (status, body): (_, RootResponse) = get_json(&app.router, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.target_deployment, "app");
    assert_eq!(body.model_version, "linear-test");
    assert_eq!(body.expected_features, 2);
    assert!(body.prometheus_connected);
    assert!(body.endpoints.contains(&"/keda-metric".to_string()));
}

#[tokio::test]
async fn test_health_not_ready_before_first_fetch() {
    let app = setup(vec![]).await;
    let (status, body): (_, HealthResponse) = get_json(&app.router, "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body.status, Readiness::NotReady);
    assert!(body.model_loaded);
    assert!(body.last_fetch_age.is_none());
}

#[tokio::test]
async fn test_health_ready_after_refresh() {
    let app = setup(vec![Ok(window(10, 50.0, 60.0, Some(100.0)))]).await;
    app.worker.run_cycle().await;

    let (status, body): (_, HealthResponse) = get_json(&app.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.status, Readiness::Ready);
    assert!(body.last_fetch_age.unwrap() <= 1);
}

#[tokio::test]
async fn test_keda_metric_falls_back_before_first_prediction() {
    let app = setup(vec![]).await;
    let (status, body): (_, ScalerMetricReading) = get_json(&app.router, "/keda-metric").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.metric_name, "predicted_pod_count");
    assert_eq!(body.metric_value, 1);
    assert!(body.fallback);
}

#[tokio::test]
async fn test_keda_metric_serves_cached_prediction() {
    let app = setup(vec![Ok(window(10, 50.0, 60.0, Some(100.0)))]).await;
    app.worker.run_cycle().await;

    let (status, body): (_, serde_json::Value) = get_json(&app.router, "/keda-metric").await;
    assert_eq!(status, StatusCode::OK);
    // 1 + 2.5 + 2.0 = 5.5 -> 6
    assert_eq!(body["metricValue"], 6);
    assert_eq!(body["stale"], false);
    assert_eq!(body["fallback"], false);
}

#[tokio::test]
async fn test_prediction_unavailable_before_first_refresh() {
    let app = setup(vec![]).await;
    let (status, body): (_, ErrorBody) = get_json(&app.router, "/predict-from-prometheus").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body.code, "not_ready");
}

#[tokio::test]
async fn test_prediction_from_cache() {
    let app = setup(vec![Ok(window(10, 50.0, 60.0, Some(100.0)))]).await;
    app.worker.run_cycle().await;

    let (status, body): (_, PredictionResponse) =
        get_json(&app.router, "/predict-from-prometheus").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.predicted_pod_count, 6);
    assert_eq!(body.model_version, "linear-test");
    assert!(!body.stale);
    assert_eq!(body.metrics_used[series::CPU_USAGE], 50.0);
    assert!(body.features.is_none());

    let (_, body): (_, PredictionResponse) =
        get_json(&app.router, "/predict-from-prometheus?include_features=true").await;
    let features = body.features.unwrap();
    assert_eq!(features.get("cpu_usage"), Some(50.0));
    assert_eq!(features.get("request_rate_rolling_10"), Some(100.0));
}

#[tokio::test]
async fn test_insufficient_data_keeps_previous_prediction() {
    let app = setup(vec![
        Ok(window(10, 50.0, 60.0, Some(100.0))),
        Ok(window(3, 95.0, 60.0, Some(900.0))),
    ])
    .await;
    app.worker.run_cycle().await;
    app.worker.run_cycle().await;

    let (status, body): (_, PredictionResponse) =
        get_json(&app.router, "/predict-from-prometheus").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.predicted_pod_count, 6);
}

#[tokio::test]
async fn test_on_demand_refresh() {
    let app = setup(vec![
        Ok(window(10, 50.0, 60.0, Some(100.0))),
        Ok(window(10, 90.0, 60.0, Some(400.0))),
        Ok(window(10, 90.0, 60.0, Some(400.0))),
    ])
    .await;
    app.worker.run_cycle().await;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let TestApp { router, worker, _dir } = app;
    let task = tokio::spawn(worker.run(shutdown_rx));

    let (status, body): (_, PredictionResponse) =
        get_json(&router, "/predict-from-prometheus?refresh=true").await;
    assert_eq!(status, StatusCode::OK);
    // 1 + 4.5 + 8.0 = 13.5 -> 14
    assert_eq!(body.predicted_pod_count, 14);
    assert!(body.refresh_error.is_none());

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_failed_on_demand_refresh_serves_cached_prediction() {
    let app = setup(vec![
        Ok(window(10, 50.0, 60.0, Some(100.0))),
        Err(PredictorError::backend_unavailable("connection refused")),
        Err(PredictorError::backend_unavailable("connection refused")),
    ])
    .await;
    app.worker.run_cycle().await;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let TestApp { router, worker, _dir } = app;
    let task = tokio::spawn(worker.run(shutdown_rx));

    let (status, body): (_, PredictionResponse) =
        get_json(&router, "/predict-from-prometheus?refresh=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.predicted_pod_count, 6);
    assert!(body.refresh_error.unwrap().contains("connection refused"));

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_current_metrics_lists_every_series() {
    let app = setup(vec![Ok(window(10, 50.0, 60.0, None))]).await;
    app.worker.run_cycle().await;

    let (status, body): (_, CurrentMetricsResponse) =
        get_json(&app.router, "/current-metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.metrics.len(), series::ALL.len());
    assert_eq!(body.metrics[series::MEMORY_USAGE], Some(60.0));
    assert_eq!(body.metrics[series::REQUEST_RATE], None);
    assert_eq!(body.missing, vec![series::REQUEST_RATE.to_string()]);
}

#[tokio::test]
async fn test_current_metrics_follow_latest_fetch() {
    let app = setup(vec![
        Ok(window(10, 50.0, 60.0, Some(100.0))),
        Ok(window(3, 95.0, 60.0, Some(100.0))),
    ])
    .await;
    app.worker.run_cycle().await;
    let (_, first): (_, CurrentMetricsResponse) = get_json(&app.router, "/current-metrics").await;

    // Next poll is too short to predict from, but its values are current
    tokio::time::sleep(Duration::from_millis(1100)).await;
    app.worker.run_cycle().await;

    let (status, body): (_, CurrentMetricsResponse) =
        get_json(&app.router, "/current-metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.metrics[series::CPU_USAGE], Some(95.0));
    assert_ne!(body.timestamp, first.timestamp);

    let (_, prediction): (_, PredictionResponse) =
        get_json(&app.router, "/predict-from-prometheus").await;
    assert_eq!(prediction.predicted_pod_count, 6);
    assert_eq!(prediction.metrics_used[series::CPU_USAGE], 50.0);
}

#[tokio::test]
async fn test_current_metrics_available_before_first_prediction() {
    let app = setup(vec![Ok(window(3, 70.0, 60.0, Some(100.0)))]).await;
    app.worker.run_cycle().await;

    let (status, body): (_, CurrentMetricsResponse) =
        get_json(&app.router, "/current-metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.metrics[series::CPU_USAGE], Some(70.0));

    let (status, _) = get(&app.router, "/predict-from-prometheus").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_current_metrics_unavailable_before_first_fetch() {
    let app = setup(vec![]).await;
    let (status, _) = get(&app.router, "/current-metrics").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_unknown_query_parameter_rejected() {
    let app = setup(vec![]).await;

    for uri in [
        "/predict-from-prometheus?verbose=true",
        "/predict-from-prometheus?refresh=maybe",
        "/keda-metric?namespace=other",
        "/health?x=1",
    ] {
        let (status, body): (_, ErrorBody) = get_json(&app.router, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "uri {uri}");
        assert_eq!(body.code, "malformed_request");
        assert!(body.details.is_some());
    }
}

#[tokio::test]
async fn test_prometheus_metrics_exposition() {
    let app = setup(vec![Ok(window(10, 50.0, 60.0, Some(100.0)))]).await;
    app.worker.run_cycle().await;

    let (status, response) = get(&app.router, "/prometheus-metrics").await;
    assert_eq!(status, StatusCode::OK);

    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("pod_predictor_predicted_pod_count"));
    assert!(text.contains("pod_predictor_model_confidence"));
}

#[test]
fn test_missing_model_is_load_failure() {
    let dir = tempfile::tempdir().unwrap();
    let err = ModelArtifact::load(&dir.path().join("absent.onnx"), None).unwrap_err();
    assert_eq!(err.code(), "model_load_failure");
}
