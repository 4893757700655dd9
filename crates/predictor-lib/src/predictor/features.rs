//! Feature extraction for replica-count inference
//!
//! Turns one poll of raw samples into a fixed, named, ordered feature
//! vector. Feature names follow the training dataset columns: per series
//! the latest value, rolling means over 10/30/120 samples, rate of change
//! and a few spread/trend statistics, plus calendar features.

use crate::error::{PredictorError, Result};
use crate::models::{series, CollectedMetrics, Feature, FeatureVector};
use chrono::{Datelike, Timelike};
use std::collections::BTreeMap;

/// Minimum number of samples a required series needs
pub const MIN_SAMPLES: usize = 5;

/// Rolling-mean windows in samples (5 min, 15 min, 1 h at 30 s step)
pub const ROLLING_WINDOWS: [usize; 3] = [10, 30, 120];

const RATIO_EPSILON: f64 = 1e-6;

/// Configuration for feature extraction
#[derive(Debug, Clone)]
pub struct FeatureConfig {
    /// Minimum samples per required series
    pub min_samples: usize,
    /// Most recent samples per series considered
    pub window_size: usize,
    /// Series without which no prediction is attempted
    pub required_series: Vec<String>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            min_samples: MIN_SAMPLES,
            window_size: 120,
            required_series: vec![
                series::CPU_USAGE.to_string(),
                series::MEMORY_USAGE.to_string(),
            ],
        }
    }
}

/// Builds feature vectors from collected metrics
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    config: FeatureConfig,
}

impl FeatureBuilder {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Names of every feature this builder emits, in order
    pub fn feature_names() -> Vec<String> {
        let mut names = Vec::new();
        for name in series::ALL {
            names.extend(series_feature_names(name));
        }
        names.extend(DERIVED_FEATURES.iter().map(|s| s.to_string()));
        names
    }

    /// Build the feature vector for one poll
    ///
    /// Output depends only on the set of samples, never on their order.
    pub fn build_features(&self, metrics: &CollectedMetrics) -> Result<FeatureVector> {
        let canonical = canonicalize(metrics);
        if canonical.is_empty() {
            return Err(PredictorError::InsufficientData {
                series: "all".to_string(),
                available: 0,
                required: self.config.min_samples,
            });
        }
        self.check_required(&canonical)?;

        let mut features = Vec::new();
        let mut window_start = i64::MAX;
        let mut window_end = i64::MIN;
        let mut latest: BTreeMap<&str, f64> = BTreeMap::new();

        for name in series::ALL {
            let points = canonical
                .get(name)
                .map(|points| recent(points, self.config.window_size))
                .unwrap_or_default();

            if points.len() < self.config.min_samples {
                features.extend(series_feature_names(name).into_iter().map(|n| Feature {
                    name: n,
                    value: 0.0,
                }));
                continue;
            }

            window_start = window_start.min(points[0].0);
            window_end = window_end.max(points[points.len() - 1].0);
            latest.insert(name, points[points.len() - 1].1);
            features.extend(series_features(name, &points));
        }

        // Only optional series were present in sufficient quantity
        if window_end == i64::MIN {
            let (name, points) = canonical
                .iter()
                .next()
                .map(|(n, p)| (n.clone(), p.len()))
                .unwrap_or_default();
            return Err(PredictorError::InsufficientData {
                series: name,
                available: points,
                required: self.config.min_samples,
            });
        }

        let cpu = latest.get(series::CPU_USAGE).copied().unwrap_or(0.0);
        let memory = latest.get(series::MEMORY_USAGE).copied().unwrap_or(0.0);
        let requests = latest.get(series::REQUEST_RATE).copied().unwrap_or(0.0);
        let (hour, day) = calendar(window_end);

        features.push(feature("cpu_memory_ratio", cpu / (memory + RATIO_EPSILON)));
        features.push(feature("network_total", requests));
        features.push(feature("hour", hour as f64));
        features.push(feature("day_of_week", day as f64));
        features.push(feature("is_weekend", if day >= 5 { 1.0 } else { 0.0 }));

        Ok(FeatureVector {
            features,
            window_start,
            window_end,
        })
    }

    fn check_required(&self, canonical: &BTreeMap<String, Vec<(i64, f64)>>) -> Result<()> {
        for name in &self.config.required_series {
            let available = canonical.get(name).map(Vec::len).unwrap_or(0);
            if available < self.config.min_samples {
                return Err(PredictorError::InsufficientData {
                    series: name.clone(),
                    available,
                    required: self.config.min_samples,
                });
            }
        }
        Ok(())
    }
}

impl Default for FeatureBuilder {
    fn default() -> Self {
        Self::new(FeatureConfig::default())
    }
}

const DERIVED_FEATURES: [&str; 5] = [
    "cpu_memory_ratio",
    "network_total",
    "hour",
    "day_of_week",
    "is_weekend",
];

fn feature(name: &str, value: f64) -> Feature {
    Feature {
        name: name.to_string(),
        value,
    }
}

fn series_feature_names(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    names.extend(ROLLING_WINDOWS.iter().map(|w| format!("{name}_rolling_{w}")));
    names.push(format!("{name}_max"));
    names.push(format!("{name}_stddev"));
    names.push(format!("{name}_trend"));
    names.push(format!("{name}_rate_of_change"));
    names.push(format!("{name}_rate_of_change_pct"));
    names
}

/// Features for one series; `points` is chronological and non-empty
fn series_features(name: &str, points: &[(i64, f64)]) -> Vec<Feature> {
    let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    let last = values[values.len() - 1];

    let mut out = vec![feature(name, last)];
    for window in ROLLING_WINDOWS {
        let tail = &values[values.len().saturating_sub(window)..];
        out.push(feature(&format!("{name}_rolling_{window}"), mean(tail)));
    }

    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let (change, change_pct) = match values.len() {
        0 | 1 => (0.0, 0.0),
        n => {
            let prev = values[n - 2];
            let delta = last - prev;
            let pct = if prev.abs() < f64::EPSILON {
                0.0
            } else {
                delta / prev * 100.0
            };
            (delta, pct)
        }
    };

    out.push(feature(&format!("{name}_max"), max));
    out.push(feature(&format!("{name}_stddev"), variance(&values).sqrt()));
    out.push(feature(&format!("{name}_trend"), slope_per_minute(points)));
    out.push(feature(&format!("{name}_rate_of_change"), change));
    out.push(feature(&format!("{name}_rate_of_change_pct"), change_pct));
    out
}

/// Group samples by series and timestamp, ordered, duplicates collapsed
fn canonicalize(metrics: &CollectedMetrics) -> BTreeMap<String, Vec<(i64, f64)>> {
    let mut grouped: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();
    for sample in &metrics.samples {
        if !sample.value.is_finite() {
            continue;
        }
        grouped
            .entry(sample.name.clone())
            .or_default()
            .entry(sample.timestamp)
            .and_modify(|v| *v = v.max(sample.value))
            .or_insert(sample.value);
    }
    grouped
        .into_iter()
        .map(|(name, points)| (name, points.into_iter().collect()))
        .collect()
}

fn recent(points: &[(i64, f64)], window: usize) -> Vec<(i64, f64)> {
    points[points.len().saturating_sub(window)..].to_vec()
}

fn calendar(timestamp: i64) -> (u32, u32) {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| (dt.hour(), dt.weekday().num_days_from_monday()))
        .unwrap_or((0, 0))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean(values);
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    sum_sq / (values.len() - 1) as f64
}

/// Least-squares slope of value over time, in units per minute
pub fn slope_per_minute(points: &[(i64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let origin = points[0].0;
    let n = points.len() as f64;
    let xs: Vec<f64> = points
        .iter()
        .map(|(ts, _)| (ts - origin) as f64 / 60.0)
        .collect();
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = xs.iter().zip(points).map(|(x, (_, y))| x * y).sum();
    let sum_x2: f64 = xs.iter().map(|x| x * x).sum();
    let denom = n * sum_x2 - sum_x.powi(2);
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}
