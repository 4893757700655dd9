//! Prediction output formatting and post-processing
//!
//! Handles conversion of raw model outputs to a Prediction with replica
//! bounds and confidence scoring.

use crate::models::Prediction;

/// Lower replica bound; the workload always keeps one pod
pub const MIN_REPLICAS: u32 = 1;

/// Upper replica bound
pub const MAX_REPLICAS: u32 = 100;

/// Confidence reported when the artifact carries no training statistics
pub const DEFAULT_CONFIDENCE: f64 = 0.95;

/// Configuration for output formatting
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub default_confidence: f64,
    /// Low confidence threshold
    pub low_confidence_threshold: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            min_replicas: MIN_REPLICAS,
            max_replicas: MAX_REPLICAS,
            default_confidence: DEFAULT_CONFIDENCE,
            low_confidence_threshold: 0.5,
        }
    }
}

/// Formats raw model outputs into a Prediction
#[derive(Debug, Clone)]
pub struct OutputFormatter {
    config: OutputConfig,
}

impl OutputFormatter {
    pub fn new() -> Self {
        Self {
            config: OutputConfig::default(),
        }
    }

    pub fn with_config(config: OutputConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Format a raw replica estimate
    ///
    /// # Arguments
    /// * `raw_replicas` - Unrounded model output
    /// * `confidence` - Distance-based confidence, `None` when no stats exist
    /// * `model_version` - Version string of the model
    pub fn format(&self, raw_replicas: f64, confidence: Option<f64>, model_version: &str) -> Prediction {
        Prediction {
            predicted_pod_count: self.clamp_replicas(raw_replicas),
            confidence: clamp_confidence(confidence.unwrap_or(self.config.default_confidence)),
            model_version: model_version.to_string(),
            generated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Round and bound a raw estimate; NaN maps to the minimum
    pub fn clamp_replicas(&self, raw: f64) -> u32 {
        if raw.is_nan() {
            return self.config.min_replicas;
        }
        let rounded = raw.round().clamp(0.0, u32::MAX as f64) as u32;
        rounded.clamp(self.config.min_replicas, self.config.max_replicas)
    }

    /// Why a prediction should be treated with caution, if it should
    pub fn low_confidence_reason(&self, prediction: &Prediction) -> Option<String> {
        if prediction.confidence <= 0.0 {
            Some("Model unavailable, heuristic estimate used".to_string())
        } else if prediction.confidence < self.config.low_confidence_threshold {
            Some("Current load lies far outside the training distribution".to_string())
        } else {
            None
        }
    }
}

impl Default for OutputFormatter {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamp to [0, 1]; NaN maps to 0
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Confidence from the root-mean-square z-score of the inputs
pub fn confidence_from_distance(rms_z: f64) -> f64 {
    if !rms_z.is_finite() {
        return 0.0;
    }
    clamp_confidence(1.0 / (1.0 + rms_z.abs()))
}
