//! Background refresh loop
//!
//! The loop is the only writer of the prediction cache. Each cycle fetches
//! metrics, builds features, predicts and publishes; a failed fetch or a
//! short window leaves the previous entry in place. On-demand refreshes
//! arrive over a channel so they run on the same task.

use crate::cache::{CacheEntry, MetricsSnapshot, PredictionCache};
use crate::collector::MetricsSource;
use crate::error::{PredictorError, Result};
use crate::health::{components, HealthRegistry};
use crate::observability::{PredictorMetrics, StructuredLogger};
use crate::predictor::{FeatureBuilder, ReplicaPredictor};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Pending on-demand requests before senders wait
const REQUEST_BUFFER: usize = 8;

/// Consecutive heuristic fallbacks after which the predictor is unhealthy
pub const FALLBACK_STREAK_UNHEALTHY: u32 = 3;

/// Configuration for the refresh loop
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Time between scheduled cycles
    pub interval: Duration,
    /// Slack on top of `interval` before a prediction counts as stale,
    /// covering cycles whose fetch runs longer than the previous one
    pub stale_grace: Duration,
}

impl RefreshConfig {
    /// Age beyond which a prediction is reported stale
    pub fn stale_after(&self) -> Duration {
        self.interval + self.stale_grace
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_grace: crate::collector::DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Result of one refresh cycle
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// A new entry was published
    Updated(Arc<CacheEntry>),
    /// The cache was left unchanged
    Skipped(PredictorError),
}

struct RefreshRequest {
    reply: oneshot::Sender<CycleOutcome>,
}

/// Handle used by the HTTP layer to ask for an immediate cycle
#[derive(Clone)]
pub struct RefreshHandle {
    sender: mpsc::Sender<RefreshRequest>,
}

impl RefreshHandle {
    /// Request a cycle and wait up to `timeout` for its outcome
    pub async fn refresh_now(&self, timeout: Duration) -> Result<Arc<CacheEntry>> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(RefreshRequest { reply })
            .await
            .map_err(|_| PredictorError::backend_unavailable("refresh loop is not running"))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(CycleOutcome::Updated(entry))) => Ok(entry),
            Ok(Ok(CycleOutcome::Skipped(err))) => Err(err),
            Ok(Err(_)) => Err(PredictorError::backend_unavailable(
                "refresh loop dropped the request",
            )),
            Err(_) => Err(PredictorError::backend_unavailable(format!(
                "refresh did not complete within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// Periodic fetch → features → predict → publish task
pub struct RefreshLoop {
    source: Arc<dyn MetricsSource>,
    features: FeatureBuilder,
    predictor: Arc<ReplicaPredictor>,
    cache: PredictionCache,
    health: HealthRegistry,
    metrics: PredictorMetrics,
    logger: StructuredLogger,
    config: RefreshConfig,
    requests: mpsc::Receiver<RefreshRequest>,
    fallback_streak: AtomicU32,
}

impl RefreshLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn MetricsSource>,
        features: FeatureBuilder,
        predictor: Arc<ReplicaPredictor>,
        cache: PredictionCache,
        health: HealthRegistry,
        metrics: PredictorMetrics,
        logger: StructuredLogger,
        config: RefreshConfig,
    ) -> (Self, RefreshHandle) {
        let (sender, requests) = mpsc::channel(REQUEST_BUFFER);
        let worker = Self {
            source,
            features,
            predictor,
            cache,
            health,
            metrics,
            logger,
            config,
            requests,
            fallback_streak: AtomicU32::new(0),
        };
        (worker, RefreshHandle { sender })
    }

    /// Register the components this loop reports on
    pub async fn register_components(&self) {
        for name in [
            components::COLLECTOR,
            components::FEATURE_BUILDER,
            components::PREDICTOR,
            components::CACHE,
        ] {
            self.health.register(name).await;
        }
    }

    /// Run until `shutdown` fires; the first cycle starts immediately
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            source = %self.source.name(),
            "Starting refresh loop"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }

                Some(request) = self.requests.recv() => {
                    let outcome = self.run_cycle().await;
                    if request.reply.send(outcome).is_err() {
                        debug!("On-demand refresh requester went away");
                    }
                    ticker.reset();
                }

                _ = shutdown.recv() => {
                    info!("Refresh loop stopping");
                    break;
                }
            }
        }
    }

    /// Execute one full cycle
    pub async fn run_cycle(&self) -> CycleOutcome {
        let started = Instant::now();

        let fetched = self.source.fetch_current_metrics().await;
        self.metrics.observe_fetch_latency(started.elapsed());

        let collected = match fetched {
            Ok(collected) => collected,
            Err(e) => {
                self.metrics.inc_fetch_errors();
                self.health
                    .set_degraded(components::COLLECTOR, e.to_string())
                    .await;
                return self.skip(e).await;
            }
        };

        // Every series empty or rejected: the backend answered but told us nothing
        if collected.samples.is_empty() {
            self.health
                .set_degraded(components::COLLECTOR, "No series returned data")
                .await;
        } else {
            self.health.record_fetch_success(collected.fetched_at).await;
            self.cache
                .publish_metrics(MetricsSnapshot::from(&collected))
                .await;

            if collected.missing.is_empty() {
                self.health.set_healthy(components::COLLECTOR).await;
            } else {
                self.health
                    .set_degraded(
                        components::COLLECTOR,
                        format!("Missing series: {}", collected.missing.join(", ")),
                    )
                    .await;
            }
        }

        let predict_started = Instant::now();
        let features = match self.features.build_features(&collected) {
            Ok(features) => features,
            Err(e) => {
                self.metrics.inc_insufficient_data();
                self.health
                    .set_degraded(components::FEATURE_BUILDER, e.to_string())
                    .await;
                return self.skip(e).await;
            }
        };
        self.health.set_healthy(components::FEATURE_BUILDER).await;

        let fallbacks_before = self.predictor.stats().fallback_predictions;
        let prediction = self.predictor.predict(&features);
        self.metrics.observe_prediction_latency(predict_started.elapsed());

        if self.predictor.stats().fallback_predictions > fallbacks_before {
            self.metrics.inc_fallback_predictions();
            let streak = self.fallback_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= FALLBACK_STREAK_UNHEALTHY {
                self.health
                    .set_unhealthy(
                        components::PREDICTOR,
                        format!("Model evaluation failed {streak} cycles in a row"),
                    )
                    .await;
            } else {
                self.health
                    .set_degraded(components::PREDICTOR, "Model evaluation failed, heuristic used")
                    .await;
            }
        } else {
            self.fallback_streak.store(0, Ordering::Relaxed);
            self.health.set_healthy(components::PREDICTOR).await;
        }
        if let Some(reason) = self.predictor.formatter().low_confidence_reason(&prediction) {
            warn!(
                component = "predictor",
                confidence = prediction.confidence,
                reason = %reason,
                "Low-confidence prediction"
            );
        }

        let latency = started.elapsed();
        let entry = CacheEntry {
            metrics: collected.latest_values(),
            missing: collected.missing,
            fetched_at: collected.fetched_at,
            prediction,
            features,
            refresh_latency: latency,
        };

        self.metrics.record_prediction(&entry.prediction, latency);
        self.logger
            .log_prediction(&entry.prediction, &entry.missing, latency);

        let entry = self.cache.publish(entry).await;
        self.health.set_healthy(components::CACHE).await;
        CycleOutcome::Updated(entry)
    }

    async fn skip(&self, error: PredictorError) -> CycleOutcome {
        self.logger
            .log_refresh_skipped(error.code(), &error.to_string());

        let now = chrono::Utc::now().timestamp();
        match self.cache.latest().await {
            Some(entry) if entry.is_stale(now, self.config.stale_after()) => {
                self.metrics.set_stale(true);
                self.health
                    .set_degraded(
                        components::CACHE,
                        format!("Prediction is {}s old", entry.prediction.age_secs(now)),
                    )
                    .await;
            }
            Some(_) => {}
            None => warn!("No prediction available yet"),
        }

        CycleOutcome::Skipped(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{async_trait, PrometheusConfig, PrometheusSource};
    use crate::health::{ComponentStatus, Readiness};
    use crate::models::{series, CollectedMetrics, MetricSample};
    use crate::predictor::{FeatureConfig, LinearModel, ModelArtifact, PredictorConfig, ReplicaModel};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Source replaying scripted responses, optionally waiting on a gate
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<CollectedMetrics>>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<CollectedMetrics>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                gate: None,
            }
        }

        fn gated(responses: Vec<Result<CollectedMetrics>>, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(responses)
            }
        }
    }

    #[async_trait]
    impl MetricsSource for ScriptedSource {
        async fn fetch_current_metrics(&self) -> Result<CollectedMetrics> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(PredictorError::backend_unavailable("script exhausted")))
        }

        async fn probe(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn window(samples: usize, cpu: f64, memory: f64, rate: f64) -> CollectedMetrics {
        let now = chrono::Utc::now().timestamp();
        let mut out = Vec::new();
        for i in 0..samples {
            let ts = now - 30 * (samples - 1 - i) as i64;
            out.push(MetricSample::new(series::CPU_USAGE, ts, cpu, "scripted"));
            out.push(MetricSample::new(series::MEMORY_USAGE, ts, memory, "scripted"));
            out.push(MetricSample::new(series::REQUEST_RATE, ts, rate, "scripted"));
        }
        CollectedMetrics {
            samples: out,
            missing: vec![],
            fetched_at: now,
        }
    }

    fn predictor() -> Arc<ReplicaPredictor> {
        let names = vec![series::CPU_USAGE.to_string(), series::REQUEST_RATE.to_string()];
        let coefficients: BTreeMap<String, f64> = [
            (series::CPU_USAGE.to_string(), 0.05),
            (series::REQUEST_RATE.to_string(), 0.02),
        ]
        .into_iter()
        .collect();
        let model = LinearModel::new(1.0, &coefficients, &names);
        let artifact = ModelArtifact::from_model(Box::new(model), "test-v1", names, BTreeMap::new());
        Arc::new(ReplicaPredictor::new(artifact, PredictorConfig::default()))
    }

    struct FailingModel;

    impl ReplicaModel for FailingModel {
        fn evaluate(&self, _inputs: &[f32]) -> anyhow::Result<f64> {
            anyhow::bail!("runtime error")
        }

        fn kind(&self) -> &'static str {
            "failing"
        }
    }

    fn failing_predictor() -> Arc<ReplicaPredictor> {
        let names = vec![series::CPU_USAGE.to_string()];
        let artifact =
            ModelArtifact::from_model(Box::new(FailingModel), "broken", names, BTreeMap::new());
        Arc::new(ReplicaPredictor::new(artifact, PredictorConfig::default()))
    }

    async fn refresh_loop(source: ScriptedSource) -> (RefreshLoop, RefreshHandle, PredictionCache, HealthRegistry) {
        refresh_loop_with(Arc::new(source), predictor()).await
    }

    async fn refresh_loop_with(
        source: Arc<dyn MetricsSource>,
        predictor: Arc<ReplicaPredictor>,
    ) -> (RefreshLoop, RefreshHandle, PredictionCache, HealthRegistry) {
        let cache = PredictionCache::new();
        let health = HealthRegistry::new(Duration::from_secs(60));
        health.set_model_loaded(true).await;
        let (worker, handle) = RefreshLoop::new(
            source,
            FeatureBuilder::new(FeatureConfig::default()),
            predictor,
            cache.clone(),
            health.clone(),
            PredictorMetrics::new(),
            StructuredLogger::new("default", "app"),
            RefreshConfig::default(),
        );
        worker.register_components().await;
        (worker, handle, cache, health)
    }

    #[tokio::test]
    async fn test_cycle_publishes_prediction() {
        let source = ScriptedSource::new(vec![Ok(window(10, 50.0, 60.0, 100.0))]);
        let (worker, _handle, cache, health) = refresh_loop(source).await;

        let outcome = worker.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Updated(_)));

        let entry = cache.latest().await.unwrap();
        // 1 + 2.5 + 2.0 = 5.5 -> 6
        assert_eq!(entry.prediction.predicted_pod_count, 6);
        assert_eq!(entry.metrics.get(series::CPU_USAGE), Some(&50.0));
        assert_eq!(health.health().await.status, Readiness::Ready);
    }

    #[tokio::test]
    async fn test_insufficient_data_keeps_previous_prediction() {
        let source = ScriptedSource::new(vec![
            Ok(window(10, 50.0, 60.0, 100.0)),
            Ok(window(3, 90.0, 60.0, 400.0)),
        ]);
        let (worker, _handle, cache, health) = refresh_loop(source).await;

        worker.run_cycle().await;
        let outcome = worker.run_cycle().await;
        match outcome {
            CycleOutcome::Skipped(PredictorError::InsufficientData { available, required, .. }) => {
                assert_eq!(available, 3);
                assert_eq!(required, 5);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(cache.latest().await.unwrap().prediction.predicted_pod_count, 6);
        // The fetch itself succeeded, so readiness holds
        assert!(health.health().await.is_ready());
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_cache_and_degrades_collector() {
        let source = ScriptedSource::new(vec![
            Ok(window(10, 50.0, 60.0, 100.0)),
            Err(PredictorError::backend_unavailable("connection refused")),
        ]);
        let (worker, _handle, cache, health) = refresh_loop(source).await;

        worker.run_cycle().await;
        let outcome = worker.run_cycle().await;
        assert!(matches!(
            outcome,
            CycleOutcome::Skipped(PredictorError::BackendUnavailable { .. })
        ));

        assert_eq!(cache.latest().await.unwrap().prediction.predicted_pod_count, 6);
        let report = health.health().await;
        let collector = &report.components[components::COLLECTOR];
        assert_eq!(collector.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_empty_fetch_is_not_a_successful_fetch() {
        let now = chrono::Utc::now().timestamp();
        let source = ScriptedSource::new(vec![Ok(CollectedMetrics {
            samples: vec![],
            missing: vec![series::CPU_USAGE.to_string(), series::MEMORY_USAGE.to_string()],
            fetched_at: now,
        })]);
        let (worker, _handle, cache, health) = refresh_loop(source).await;

        let outcome = worker.run_cycle().await;
        assert!(matches!(
            outcome,
            CycleOutcome::Skipped(PredictorError::InsufficientData { .. })
        ));

        let report = health.health().await;
        assert!(!report.is_ready());
        assert!(report.last_fetch_age.is_none());
        assert_eq!(report.components[components::COLLECTOR].status, ComponentStatus::Degraded);
        assert!(cache.latest_metrics().await.is_none());
    }

    #[tokio::test]
    async fn test_backend_answering_503_keeps_service_not_ready() {
        let mut server = mockito::Server::new_async().await;
        let _all = server
            .mock("GET", "/api/v1/query_range")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .with_body(r#"{"status":"error","errorType":"timeout","error":"query timed out"}"#)
            .create_async()
            .await;

        let source = PrometheusSource::new(PrometheusConfig {
            url: server.url(),
            ..Default::default()
        })
        .unwrap();
        let (worker, _handle, _cache, health) = refresh_loop_with(Arc::new(source), predictor()).await;

        let outcome = worker.run_cycle().await;
        assert!(matches!(
            outcome,
            CycleOutcome::Skipped(PredictorError::BackendUnavailable { .. })
        ));

        let report = health.health().await;
        assert!(!report.is_ready());
        assert!(report.last_fetch_age.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_follows_fetch_not_prediction() {
        let source = ScriptedSource::new(vec![
            Ok(window(10, 50.0, 60.0, 100.0)),
            Ok(window(3, 95.0, 60.0, 100.0)),
        ]);
        let (worker, _handle, cache, _health) = refresh_loop(source).await;

        worker.run_cycle().await;
        let first = cache.latest_metrics().await.unwrap();
        assert_eq!(first.values.get(series::CPU_USAGE), Some(&50.0));

        // Too short to predict from, but the fetch itself succeeded
        worker.run_cycle().await;
        let second = cache.latest_metrics().await.unwrap();
        assert_eq!(second.values.get(series::CPU_USAGE), Some(&95.0));
        assert!(second.fetched_at >= first.fetched_at);
        assert_eq!(cache.latest().await.unwrap().metrics.get(series::CPU_USAGE), Some(&50.0));
    }

    #[tokio::test]
    async fn test_repeated_fallbacks_mark_predictor_unhealthy() {
        let responses = (0..FALLBACK_STREAK_UNHEALTHY)
            .map(|_| Ok(window(10, 50.0, 60.0, 100.0)))
            .collect();
        let source = Arc::new(ScriptedSource::new(responses));
        let (worker, _handle, cache, health) = refresh_loop_with(source, failing_predictor()).await;

        for _ in 1..FALLBACK_STREAK_UNHEALTHY {
            worker.run_cycle().await;
        }
        let report = health.health().await;
        assert!(report.is_ready());
        assert_eq!(report.components[components::PREDICTOR].status, ComponentStatus::Degraded);

        worker.run_cycle().await;
        let report = health.health().await;
        assert!(!report.is_ready());
        assert_eq!(report.components[components::PREDICTOR].status, ComponentStatus::Unhealthy);
        assert_eq!(report.reason.as_deref(), Some("Critical component unhealthy"));

        // The heuristic still produced a bounded answer: 100 rps / 50 per pod
        let entry = cache.latest().await.unwrap();
        assert_eq!(entry.prediction.predicted_pod_count, 2);
        assert_eq!(entry.prediction.confidence, 0.0);
    }

    #[test]
    fn test_stale_after_includes_grace() {
        let config = RefreshConfig::default();
        assert_eq!(config.stale_after(), Duration::from_secs(35));
    }

    #[tokio::test]
    async fn test_backend_failure_before_first_prediction() {
        let source = ScriptedSource::new(vec![Err(PredictorError::backend_unavailable("down"))]);
        let (worker, _handle, cache, health) = refresh_loop(source).await;

        worker.run_cycle().await;
        assert!(cache.latest().await.is_none());
        assert!(!health.health().await.is_ready());
    }

    #[tokio::test]
    async fn test_refresh_now_runs_on_loop() {
        let source = ScriptedSource::new(vec![
            Ok(window(10, 50.0, 60.0, 100.0)),
            Ok(window(10, 90.0, 60.0, 400.0)),
        ]);
        let (worker, handle, cache, _health) = refresh_loop(source).await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(worker.run(shutdown_rx));

        // The first tick fires immediately; the on-demand cycle follows it
        let entry = loop {
            let entry = handle.refresh_now(Duration::from_secs(5)).await;
            match entry {
                Ok(e) if e.prediction.predicted_pod_count == 14 => break e,
                Ok(_) => continue,
                Err(e) => panic!("refresh failed: {e}"),
            }
        };
        // 1 + 4.5 + 8.0 = 13.5 -> 14
        assert_eq!(entry.prediction.predicted_pod_count, 14);
        assert_eq!(cache.latest().await.unwrap().prediction.predicted_pod_count, 14);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_now_reports_skipped_cycle() {
        let source = ScriptedSource::new(vec![Err(PredictorError::backend_unavailable("down"))]);
        let (worker, handle, _cache, _health) = refresh_loop(source).await;

        let worker_task = tokio::spawn(async move {
            // Serve exactly one request without the ticker
            let mut worker = worker;
            if let Some(request) = worker.requests.recv().await {
                let outcome = worker.run_cycle().await;
                let _ = request.reply.send(outcome);
            }
        });

        let err = handle.refresh_now(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.code(), "backend_unavailable");
        worker_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_now_without_loop() {
        let source = ScriptedSource::new(vec![]);
        let (worker, handle, _cache, _health) = refresh_loop(source).await;
        drop(worker);

        let err = handle.refresh_now(Duration::from_millis(100)).await.unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn test_readers_see_previous_entry_during_refresh() {
        let gate = Arc::new(Notify::new());
        let source = ScriptedSource::gated(
            vec![Ok(window(10, 50.0, 60.0, 100.0)), Ok(window(10, 90.0, 60.0, 400.0))],
            gate.clone(),
        );
        let (worker, _handle, cache, _health) = refresh_loop(source).await;
        let worker = Arc::new(worker);

        gate.notify_one();
        worker.run_cycle().await;

        let in_flight = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run_cycle().await })
        };
        tokio::task::yield_now().await;

        // Fetch is blocked on the gate; readers still get the old entry
        assert_eq!(cache.latest().await.unwrap().prediction.predicted_pod_count, 6);

        gate.notify_one();
        assert!(matches!(in_flight.await.unwrap(), CycleOutcome::Updated(_)));
        assert_eq!(cache.latest().await.unwrap().prediction.predicted_pod_count, 14);
    }
}
