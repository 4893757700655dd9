//! Observability infrastructure for the pod predictor
//!
//! Provides:
//! - Prometheus metrics (prediction output, fetch and prediction latency, error counters)
//! - Structured JSON logging with tracing

use crate::models::Prediction;
use prometheus::{
    register_gauge, register_gauge_vec, register_histogram, register_int_counter,
    register_int_gauge, Encoder, Gauge, GaugeVec, Histogram, IntCounter, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PredictorMetricsInner> = OnceLock::new();

struct PredictorMetricsInner {
    predictions_total: IntCounter,
    predicted_pod_count: IntGauge,
    model_confidence: Gauge,
    last_prediction_latency_seconds: Gauge,
    prediction_latency_seconds: Histogram,
    fetch_latency_seconds: Histogram,
    fetch_errors: IntCounter,
    insufficient_data: IntCounter,
    fallback_predictions: IntCounter,
    prediction_stale: IntGauge,
    model_version_info: GaugeVec,
}

impl PredictorMetricsInner {
    fn new() -> Self {
        Self {
            predictions_total: register_int_counter!(
                "pod_predictor_predictions_total",
                "Total number of predictions published to the cache"
            )
            .expect("Failed to register predictions_total"),

            predicted_pod_count: register_int_gauge!(
                "pod_predictor_predicted_pod_count",
                "Most recently predicted replica count"
            )
            .expect("Failed to register predicted_pod_count"),

            model_confidence: register_gauge!(
                "pod_predictor_model_confidence",
                "Confidence of the most recent prediction"
            )
            .expect("Failed to register model_confidence"),

            last_prediction_latency_seconds: register_gauge!(
                "pod_predictor_last_prediction_latency_seconds",
                "Duration of the most recent refresh cycle"
            )
            .expect("Failed to register last_prediction_latency_seconds"),

            prediction_latency_seconds: register_histogram!(
                "pod_predictor_prediction_latency_seconds",
                "Time spent building features and running inference",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            fetch_latency_seconds: register_histogram!(
                "pod_predictor_fetch_latency_seconds",
                "Time spent fetching metrics from the backend",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register fetch_latency_seconds"),

            fetch_errors: register_int_counter!(
                "pod_predictor_fetch_errors_total",
                "Total number of failed metric fetches"
            )
            .expect("Failed to register fetch_errors_total"),

            insufficient_data: register_int_counter!(
                "pod_predictor_insufficient_data_total",
                "Refresh cycles skipped for lack of samples"
            )
            .expect("Failed to register insufficient_data_total"),

            fallback_predictions: register_int_counter!(
                "pod_predictor_fallback_predictions_total",
                "Predictions produced by the request-rate heuristic"
            )
            .expect("Failed to register fallback_predictions_total"),

            prediction_stale: register_int_gauge!(
                "pod_predictor_prediction_stale",
                "1 when the cached prediction is older than one refresh interval"
            )
            .expect("Failed to register prediction_stale"),

            model_version_info: register_gauge_vec!(
                "pod_predictor_model_version_info",
                "Information about the loaded model artifact",
                &["version", "kind"]
            )
            .expect("Failed to register model_version_info"),
        }
    }
}

/// Predictor metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct PredictorMetrics {
    _private: (),
}

impl Default for PredictorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PredictorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PredictorMetricsInner {
        GLOBAL_METRICS.get_or_init(PredictorMetricsInner::new)
    }

    /// Record a published prediction
    pub fn record_prediction(&self, prediction: &Prediction, latency: Duration) {
        let inner = self.inner();
        inner.predictions_total.inc();
        inner.predicted_pod_count.set(i64::from(prediction.predicted_pod_count));
        inner.model_confidence.set(prediction.confidence);
        inner.last_prediction_latency_seconds.set(latency.as_secs_f64());
        inner.prediction_stale.set(0);
    }

    pub fn observe_prediction_latency(&self, duration: Duration) {
        self.inner().prediction_latency_seconds.observe(duration.as_secs_f64());
    }

    pub fn observe_fetch_latency(&self, duration: Duration) {
        self.inner().fetch_latency_seconds.observe(duration.as_secs_f64());
    }

    pub fn inc_fetch_errors(&self) {
        self.inner().fetch_errors.inc();
    }

    pub fn inc_insufficient_data(&self) {
        self.inner().insufficient_data.inc();
    }

    pub fn inc_fallback_predictions(&self) {
        self.inner().fallback_predictions.inc();
    }

    pub fn set_stale(&self, stale: bool) {
        self.inner().prediction_stale.set(i64::from(stale));
    }

    /// Update model version info
    pub fn set_model_version(&self, version: &str, kind: &str) {
        self.inner().model_version_info.reset();
        self.inner()
            .model_version_info
            .with_label_values(&[version, kind])
            .set(1.0);
    }

    /// Encode every registered metric in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

/// Structured logger for predictor events
#[derive(Clone)]
pub struct StructuredLogger {
    workload: String,
}

impl StructuredLogger {
    /// Logger tagged with the `namespace/deployment` being predicted
    pub fn new(namespace: &str, deployment: &str) -> Self {
        Self {
            workload: format!("{namespace}/{deployment}"),
        }
    }

    pub fn workload(&self) -> &str {
        &self.workload
    }

    pub fn log_prediction(&self, prediction: &Prediction, missing: &[String], latency: Duration) {
        if prediction.confidence <= 0.0 {
            warn!(
                event = "prediction_generated",
                workload = %self.workload,
                predicted_pod_count = prediction.predicted_pod_count,
                confidence = prediction.confidence,
                model_version = %prediction.model_version,
                missing_series = ?missing,
                latency_ms = latency.as_millis() as u64,
                "Generated heuristic replica prediction"
            );
        } else {
            info!(
                event = "prediction_generated",
                workload = %self.workload,
                predicted_pod_count = prediction.predicted_pod_count,
                confidence = prediction.confidence,
                model_version = %prediction.model_version,
                missing_series = ?missing,
                latency_ms = latency.as_millis() as u64,
                "Generated replica prediction"
            );
        }
    }

    /// Log a refresh cycle that left the cache unchanged
    pub fn log_refresh_skipped(&self, code: &str, reason: &str) {
        warn!(
            event = "refresh_skipped",
            workload = %self.workload,
            code = %code,
            reason = %reason,
            "Refresh cycle skipped, keeping previous prediction"
        );
    }

    pub fn log_model_loaded(&self, version: &str, kind: &str, features: usize) {
        info!(
            event = "model_loaded",
            workload = %self.workload,
            model_version = %version,
            kind = %kind,
            features = features,
            "Model artifact loaded"
        );
    }

    pub fn log_startup(&self, version: &str, model_version: &str, port: u16) {
        info!(
            event = "service_started",
            workload = %self.workload,
            service_version = %version,
            model_version = %model_version,
            port = port,
            "Pod predictor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            workload = %self.workload,
            reason = %reason,
            "Pod predictor shutting down"
        );
    }
}
