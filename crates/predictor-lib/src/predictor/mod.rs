//! ML prediction engine

mod features;
mod inference;
mod model;
mod output;

pub use features::{slope_per_minute, FeatureBuilder, FeatureConfig, MIN_SAMPLES, ROLLING_WINDOWS};
pub use inference::{
    FallbackPredictor, InferenceStats, PredictorConfig, PreparedInput, ReplicaPredictor,
    DEFAULT_TARGET_RPS_PER_POD,
};
pub use model::{
    compute_checksum, FeatureStats, LinearModel, ModelArtifact, ModelMetadata, OnnxModel,
    ReplicaModel,
};
pub use output::{
    clamp_confidence, confidence_from_distance, OutputConfig, OutputFormatter,
    DEFAULT_CONFIDENCE, MAX_REPLICAS, MIN_REPLICAS,
};
