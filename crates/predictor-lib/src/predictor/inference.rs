//! Replica-count inference over a loaded model artifact
//!
//! Inputs are aligned to the model's feature order, sanitised and clamped
//! to the training range. Prediction never fails: a model error falls back
//! to a request-rate heuristic with zero confidence.

use super::model::ModelArtifact;
use super::output::{confidence_from_distance, OutputConfig, OutputFormatter};
use crate::models::{series, FeatureVector, Prediction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Maximum inference latency before warning (5ms target)
const MAX_INFERENCE_MS: u128 = 5;

/// Requests per second one pod is expected to absorb, for the fallback
pub const DEFAULT_TARGET_RPS_PER_POD: f64 = 50.0;

/// Configuration for the replica predictor
#[derive(Debug, Clone)]
pub struct PredictorConfig {
    pub output: OutputConfig,
    pub target_rps_per_pod: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            target_rps_per_pod: DEFAULT_TARGET_RPS_PER_POD,
        }
    }
}

/// Model input row prepared from a feature vector
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInput {
    pub values: Vec<f32>,
    /// Root-mean-square z-score against training stats, if any exist
    pub rms_z: Option<f64>,
    /// Features that had to be clamped into the training range
    pub clamped: usize,
}

/// Predictor wrapping an immutable model artifact
pub struct ReplicaPredictor {
    artifact: ModelArtifact,
    formatter: OutputFormatter,
    fallback: FallbackPredictor,
    inference_count: AtomicU64,
    slow_inference_count: AtomicU64,
    fallback_count: AtomicU64,
}

impl ReplicaPredictor {
    pub fn new(artifact: ModelArtifact, config: PredictorConfig) -> Self {
        let formatter = OutputFormatter::with_config(config.output);
        Self {
            artifact,
            fallback: FallbackPredictor::new(formatter.clone(), config.target_rps_per_pod),
            formatter,
            inference_count: AtomicU64::new(0),
            slow_inference_count: AtomicU64::new(0),
            fallback_count: AtomicU64::new(0),
        }
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn model_version(&self) -> &str {
        self.artifact.version()
    }

    pub fn formatter(&self) -> &OutputFormatter {
        &self.formatter
    }

    /// Align features to model order, replacing non-finite values and
    /// clamping to the training range
    pub fn prepare(&self, features: &FeatureVector) -> PreparedInput {
        let mut values = Vec::with_capacity(self.artifact.feature_names().len());
        let mut z_sq_sum = 0.0;
        let mut z_count = 0usize;
        let mut clamped = 0usize;

        for (name, stats) in self
            .artifact
            .feature_names()
            .iter()
            .zip(self.artifact.feature_stats())
        {
            let raw = features.get(name).filter(|v| v.is_finite()).unwrap_or(0.0);
            let mut value = raw;

            if let Some(stats) = stats {
                if stats.std > f64::EPSILON {
                    let z = (raw - stats.mean) / stats.std;
                    z_sq_sum += z * z;
                    z_count += 1;
                }
                let lo = stats.min.unwrap_or(f64::NEG_INFINITY);
                let hi = stats.max.unwrap_or(f64::INFINITY);
                if lo <= hi && (value < lo || value > hi) {
                    value = value.clamp(lo, hi);
                    clamped += 1;
                }
            }
            values.push(value as f32);
        }

        let rms_z = (z_count > 0).then(|| (z_sq_sum / z_count as f64).sqrt());
        PreparedInput {
            values,
            rms_z,
            clamped,
        }
    }

    /// Predict a replica count; always returns a bounded answer
    pub fn predict(&self, features: &FeatureVector) -> Prediction {
        let start = Instant::now();
        let input = self.prepare(features);

        let raw = match self.artifact.model().evaluate(&input.values) {
            Ok(raw) if raw.is_finite() => raw,
            Ok(raw) => {
                warn!(component = "predictor", raw = raw, "Model produced non-finite output, using fallback");
                return self.use_fallback(features);
            }
            Err(e) => {
                warn!(component = "predictor", error = %e, "Inference error, using fallback");
                return self.use_fallback(features);
            }
        };

        let elapsed = start.elapsed();
        self.inference_count.fetch_add(1, Ordering::Relaxed);
        if elapsed.as_millis() > MAX_INFERENCE_MS {
            self.slow_inference_count.fetch_add(1, Ordering::Relaxed);
            warn!(elapsed_ms = elapsed.as_millis(), "Inference exceeded {}ms target", MAX_INFERENCE_MS);
        } else {
            debug!(elapsed_us = elapsed.as_micros(), clamped = input.clamped, "Inference completed");
        }

        let confidence = input.rms_z.map(confidence_from_distance);
        self.formatter.format(raw, confidence, self.artifact.version())
    }

    fn use_fallback(&self, features: &FeatureVector) -> Prediction {
        self.fallback_count.fetch_add(1, Ordering::Relaxed);
        self.fallback.predict(features)
    }

    /// Get inference statistics
    pub fn stats(&self) -> InferenceStats {
        InferenceStats {
            total_inferences: self.inference_count.load(Ordering::Relaxed),
            slow_inferences: self.slow_inference_count.load(Ordering::Relaxed),
            fallback_predictions: self.fallback_count.load(Ordering::Relaxed),
        }
    }
}

/// Inference statistics
#[derive(Debug, Clone, Default)]
pub struct InferenceStats {
    pub total_inferences: u64,
    pub slow_inferences: u64,
    pub fallback_predictions: u64,
}

/// Heuristic used when the model cannot produce an answer
#[derive(Debug, Clone)]
pub struct FallbackPredictor {
    formatter: OutputFormatter,
    target_rps_per_pod: f64,
}

impl FallbackPredictor {
    pub fn new(formatter: OutputFormatter, target_rps_per_pod: f64) -> Self {
        Self {
            formatter,
            target_rps_per_pod,
        }
    }

    /// One pod per `target_rps_per_pod` requests, zero confidence
    pub fn predict(&self, features: &FeatureVector) -> Prediction {
        let rate = features
            .get(series::REQUEST_RATE)
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(0.0);
        let raw = if self.target_rps_per_pod > 0.0 {
            (rate / self.target_rps_per_pod).ceil()
        } else {
            0.0
        };
        self.formatter.format(raw, Some(0.0), "fallback")
    }
}
