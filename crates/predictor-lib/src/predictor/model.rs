//! Model artifact loading
//!
//! A model artifact is an opaque, read-only file loaded once at startup.
//! Two formats are understood, picked by file extension:
//! - `.onnx`: evaluated with tract, input shape `[1, n_features]`
//! - `.json`: linear model `{"intercept": f, "coefficients": {"name": w}}`
//!
//! An optional metadata JSON produced at training time carries the model
//! version, the feature order and per-feature training statistics.

use crate::error::{PredictorError, Result};
use anyhow::Context;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tract_onnx::prelude::*;
use tracing::{debug, warn};

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// A loaded model that maps an ordered input row to a raw replica estimate
pub trait ReplicaModel: Send + Sync {
    /// Evaluate one input row; `inputs.len()` equals the artifact's feature count
    fn evaluate(&self, inputs: &[f32]) -> anyhow::Result<f64>;

    /// Short artifact kind label, e.g. "onnx"
    fn kind(&self) -> &'static str;
}

/// Training distribution summary of one feature
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    pub std: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Metadata file written alongside the model during training
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelMetadata {
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub selected_features: Vec<String>,
    #[serde(default)]
    pub feature_stats: BTreeMap<String, FeatureStats>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ModelMetadata {
    /// Feature order expected by the model
    fn expected_features(&self) -> Vec<String> {
        if self.feature_names.is_empty() {
            self.selected_features.clone()
        } else {
            self.feature_names.clone()
        }
    }
}

/// ONNX model evaluated with tract
pub struct OnnxModel {
    plan: TractModel,
    num_features: usize,
}

impl OnnxModel {
    pub fn from_bytes(bytes: &[u8], num_features: usize) -> anyhow::Result<Self> {
        let plan = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact([1, num_features]).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;
        Ok(Self { plan, num_features })
    }
}

impl ReplicaModel for OnnxModel {
    fn evaluate(&self, inputs: &[f32]) -> anyhow::Result<f64> {
        let input: Tensor =
            tract_ndarray::Array2::from_shape_vec((1, self.num_features), inputs.to_vec())
                .context("Input row does not match model width")?
                .into();
        let result = self.plan.run(tvec!(input.into()))?;
        let output = result.first().context("No output from model")?;
        let view = output.to_array_view::<f32>()?;
        let raw = view.iter().next().copied().context("Model output is empty")?;
        Ok(raw as f64)
    }

    fn kind(&self) -> &'static str {
        "onnx"
    }
}

#[derive(Debug, Deserialize)]
struct LinearDefinition {
    #[serde(default)]
    version: Option<String>,
    intercept: f64,
    coefficients: BTreeMap<String, f64>,
}

/// Linear regression over named features
#[derive(Debug, Clone)]
pub struct LinearModel {
    intercept: f64,
    weights: Vec<f64>,
}

impl LinearModel {
    /// Align the coefficient map to `feature_names`; unnamed features weigh 0
    pub fn new(intercept: f64, coefficients: &BTreeMap<String, f64>, feature_names: &[String]) -> Self {
        let weights = feature_names
            .iter()
            .map(|name| coefficients.get(name).copied().unwrap_or(0.0))
            .collect();
        Self { intercept, weights }
    }
}

impl ReplicaModel for LinearModel {
    fn evaluate(&self, inputs: &[f32]) -> anyhow::Result<f64> {
        if inputs.len() != self.weights.len() {
            anyhow::bail!(
                "Input has {} values, model expects {}",
                inputs.len(),
                self.weights.len()
            );
        }
        let dot: f64 = self
            .weights
            .iter()
            .zip(inputs)
            .map(|(w, x)| w * *x as f64)
            .sum();
        Ok(self.intercept + dot)
    }

    fn kind(&self) -> &'static str {
        "linear"
    }
}

/// A fully loaded, immutable model artifact
pub struct ModelArtifact {
    model: Box<dyn ReplicaModel>,
    version: String,
    feature_names: Vec<String>,
    feature_stats: Vec<Option<FeatureStats>>,
    checksum: String,
    path: PathBuf,
}

impl std::fmt::Debug for ModelArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelArtifact")
            .field("kind", &self.model.kind())
            .field("version", &self.version)
            .field("features", &self.feature_names.len())
            .field("path", &self.path)
            .finish()
    }
}

impl ModelArtifact {
    /// Load a model and its optional metadata file
    ///
    /// Any problem with the artifact itself is a `ModelLoadFailure`. A
    /// missing metadata file is tolerated when the model can describe its
    /// own features (linear models).
    pub fn load(model_path: &Path, metadata_path: Option<&Path>) -> Result<Self> {
        let bytes = std::fs::read(model_path)
            .map_err(|e| PredictorError::model_load(model_path, e))?;
        let checksum = compute_checksum(&bytes);

        let metadata = match metadata_path {
            Some(path) if path.is_file() => read_metadata(path)
                .map_err(|e| PredictorError::model_load(model_path, format!("{e:#}")))?,
            Some(path) => {
                warn!(path = %path.display(), "Model metadata file not found, continuing without it");
                ModelMetadata::default()
            }
            None => ModelMetadata::default(),
        };

        if let Some(expected) = &metadata.sha256 {
            if !expected.eq_ignore_ascii_case(&checksum) {
                return Err(PredictorError::model_load(
                    model_path,
                    format!("checksum mismatch: expected {expected}, got {checksum}"),
                ));
            }
        }

        let extension = model_path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let (model, feature_names, artifact_version): (Box<dyn ReplicaModel>, Vec<String>, Option<String>) =
            match extension.as_str() {
                "onnx" => {
                    let names = metadata.expected_features();
                    if names.is_empty() {
                        return Err(PredictorError::model_load(
                            model_path,
                            "could not determine expected feature names: metadata lists none",
                        ));
                    }
                    let model = OnnxModel::from_bytes(&bytes, names.len())
                        .map_err(|e| PredictorError::model_load(model_path, format!("{e:#}")))?;
                    (Box::new(model), names, None)
                }
                "json" => {
                    let definition: LinearDefinition = serde_json::from_slice(&bytes)
                        .map_err(|e| PredictorError::model_load(model_path, e))?;
                    let mut names = metadata.expected_features();
                    if names.is_empty() {
                        names = definition.coefficients.keys().cloned().collect();
                    }
                    if names.is_empty() {
                        return Err(PredictorError::model_load(
                            model_path,
                            "linear model has no coefficients",
                        ));
                    }
                    let model = LinearModel::new(definition.intercept, &definition.coefficients, &names);
                    (Box::new(model), names, definition.version)
                }
                other => {
                    return Err(PredictorError::model_load(
                        model_path,
                        format!("unsupported model format '{other}', expected .onnx or .json"),
                    ))
                }
            };

        let version = metadata
            .model_version
            .clone()
            .or(artifact_version)
            .unwrap_or_else(|| format!("sha256-{}", &checksum[..12]));

        let feature_stats = feature_names
            .iter()
            .map(|name| metadata.feature_stats.get(name).copied())
            .collect();

        debug!(
            path = %model_path.display(),
            kind = model.kind(),
            version = %version,
            features = feature_names.len(),
            "Model artifact loaded"
        );

        Ok(Self {
            model,
            version,
            feature_names,
            feature_stats,
            checksum,
            path: model_path.to_path_buf(),
        })
    }

    /// Build an artifact from an in-memory model
    pub fn from_model(
        model: Box<dyn ReplicaModel>,
        version: impl Into<String>,
        feature_names: Vec<String>,
        feature_stats: BTreeMap<String, FeatureStats>,
    ) -> Self {
        let stats = feature_names
            .iter()
            .map(|name| feature_stats.get(name).copied())
            .collect();
        Self {
            model,
            version: version.into(),
            feature_names,
            feature_stats: stats,
            checksum: String::new(),
            path: PathBuf::new(),
        }
    }

    pub fn model(&self) -> &dyn ReplicaModel {
        self.model.as_ref()
    }

    pub fn kind(&self) -> &'static str {
        self.model.kind()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Training statistics aligned with `feature_names`
    pub fn feature_stats(&self) -> &[Option<FeatureStats>] {
        &self.feature_stats
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_metadata(path: &Path) -> anyhow::Result<ModelMetadata> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse metadata file {}", path.display()))
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const LINEAR: &str = r#"{
        "version": "linear-v1",
        "intercept": 1.0,
        "coefficients": { "request_rate": 0.02, "cpu_usage": 0.05 }
    }"#;

    #[test]
    fn test_load_linear_model_without_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        fs::write(&path, LINEAR).unwrap();

        let artifact = ModelArtifact::load(&path, None).unwrap();
        assert_eq!(artifact.kind(), "linear");
        assert_eq!(artifact.version(), "linear-v1");
        // BTreeMap key order
        assert_eq!(artifact.feature_names(), &["cpu_usage", "request_rate"]);

        let raw = artifact.model().evaluate(&[50.0, 100.0]).unwrap();
        assert!((raw - (1.0 + 2.5 + 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_metadata_defines_order_version_and_stats() {
        let dir = TempDir::new().unwrap();
        let model_path = dir.path().join("model.json");
        let meta_path = dir.path().join("metadata.json");
        fs::write(&model_path, LINEAR).unwrap();
        fs::write(
            &meta_path,
            r#"{
                "model_version": "2.0.0",
                "selected_features": ["request_rate", "cpu_usage", "queue_length"],
                "feature_stats": { "cpu_usage": { "mean": 40.0, "std": 10.0, "min": 0.0, "max": 100.0 } }
            }"#,
        )
        .unwrap();

        let artifact = ModelArtifact::load(&model_path, Some(&meta_path)).unwrap();
        assert_eq!(artifact.version(), "2.0.0");
        assert_eq!(artifact.feature_names(), &["request_rate", "cpu_usage", "queue_length"]);
        assert!(artifact.feature_stats()[0].is_none());
        assert_eq!(artifact.feature_stats()[1].unwrap().mean, 40.0);

        // queue_length has no coefficient
        let raw = artifact.model().evaluate(&[100.0, 50.0, 7.0]).unwrap();
        assert!((raw - 5.5).abs() < 1e-6);
    }

    #[test]
    fn test_missing_model_is_load_failure() {
        let dir = TempDir::new().unwrap();
        let result = ModelArtifact::load(&dir.path().join("absent.onnx"), None);
        assert!(matches!(result, Err(PredictorError::ModelLoadFailure { .. })));
    }

    #[test]
    fn test_checksum_mismatch_is_load_failure() {
        let dir = TempDir::new().unwrap();
        let model_path = dir.path().join("model.json");
        let meta_path = dir.path().join("metadata.json");
        fs::write(&model_path, LINEAR).unwrap();
        fs::write(&meta_path, r#"{"sha256": "deadbeef"}"#).unwrap();

        let err = ModelArtifact::load(&model_path, Some(&meta_path)).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_matching_checksum_accepted() {
        let dir = TempDir::new().unwrap();
        let model_path = dir.path().join("model.json");
        let meta_path = dir.path().join("metadata.json");
        fs::write(&model_path, LINEAR).unwrap();
        let checksum = compute_checksum(LINEAR.as_bytes());
        fs::write(&meta_path, format!(r#"{{"sha256": "{checksum}"}}"#)).unwrap();

        let artifact = ModelArtifact::load(&model_path, Some(&meta_path)).unwrap();
        assert_eq!(artifact.checksum(), checksum);
    }

    #[test]
    fn test_onnx_requires_feature_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"not really onnx").unwrap();

        let err = ModelArtifact::load(&path, None).unwrap_err();
        assert!(err.to_string().contains("feature names"));
    }

    #[test]
    fn test_corrupt_onnx_is_load_failure() {
        let dir = TempDir::new().unwrap();
        let model_path = dir.path().join("model.onnx");
        let meta_path = dir.path().join("metadata.json");
        fs::write(&model_path, b"not really onnx").unwrap();
        fs::write(&meta_path, r#"{"feature_names": ["cpu_usage"]}"#).unwrap();

        let result = ModelArtifact::load(&model_path, Some(&meta_path));
        assert!(matches!(result, Err(PredictorError::ModelLoadFailure { .. })));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.pkl");
        fs::write(&path, b"pickle").unwrap();

        let err = ModelArtifact::load(&path, None).unwrap_err();
        assert!(err.to_string().contains("unsupported model format"));
    }

    #[test]
    fn test_linear_model_width_mismatch() {
        let model = LinearModel::new(0.0, &BTreeMap::new(), &["a".to_string()]);
        assert!(model.evaluate(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_checksum_computation() {
        assert_eq!(
            compute_checksum(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
