//! Error taxonomy for the prediction pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the collector, feature builder, model loader and API layer
///
/// Prediction itself has no error variant: the predictor always produces
/// a replica count, falling back to a heuristic when the model misbehaves.
#[derive(Debug, Clone, Error)]
pub enum PredictorError {
    /// Metrics backend timed out or could not be reached
    #[error("metrics backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// Not enough samples in the window for a required series
    #[error("insufficient data for '{series}': {available} samples, need {required}")]
    InsufficientData {
        series: String,
        available: usize,
        required: usize,
    },

    /// Model artifact could not be loaded at startup
    #[error("failed to load model from {}: {reason}", path.display())]
    ModelLoadFailure { path: PathBuf, reason: String },

    /// Client sent unsupported or unparsable request parameters
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl PredictorError {
    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    pub fn model_load(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::ModelLoadFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable code used in logs and API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::ModelLoadFailure { .. } => "model_load_failure",
            Self::MalformedRequest(_) => "malformed_request",
        }
    }
}

pub type Result<T> = std::result::Result<T, PredictorError>;
