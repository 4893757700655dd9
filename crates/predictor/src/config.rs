//! Service configuration

use anyhow::{bail, Context, Result};
use predictor_lib::collector::PrometheusConfig;
use predictor_lib::predictor::{FeatureConfig, OutputConfig, PredictorConfig};
use predictor_lib::refresh::RefreshConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix for every setting
pub const ENV_PREFIX: &str = "PREDICTOR";

/// Optional configuration file read before the environment overlay
pub const CONFIG_FILE_ENV: &str = "PREDICTOR_CONFIG_FILE";

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    #[serde(default = "default_target_namespace")]
    pub target_namespace: String,

    #[serde(default = "default_target_deployment")]
    pub target_deployment: String,

    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    #[serde(default = "default_model_metadata_path")]
    pub model_metadata_path: PathBuf,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Maximum age of the last successful fetch for readiness;
    /// twice the refresh interval when unset
    #[serde(default)]
    pub staleness_threshold_secs: Option<u64>,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Length of the sample window queried per series
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,

    #[serde(default = "default_step")]
    pub step_secs: u64,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,

    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,

    /// Requests per second one pod absorbs, for the heuristic fallback
    #[serde(default = "default_target_rps_per_pod")]
    pub target_rps_per_pod: f64,
}

fn default_port() -> u16 {
    8000
}

fn default_prometheus_url() -> String {
    "http://monitoring-kube-prometheus-prometheus.monitoring.svc.cluster.local:9090".to_string()
}

fn default_target_namespace() -> String {
    "default".to_string()
}

fn default_target_deployment() -> String {
    "app".to_string()
}

fn default_model_path() -> PathBuf {
    PathBuf::from("/app/model/pod_predictor.onnx")
}

fn default_model_metadata_path() -> PathBuf {
    PathBuf::from("/app/model/metadata.json")
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_fetch_timeout() -> u64 {
    5
}

fn default_window_minutes() -> u64 {
    10
}

fn default_step() -> u64 {
    30
}

fn default_min_samples() -> usize {
    predictor_lib::predictor::MIN_SAMPLES
}

fn default_min_replicas() -> u32 {
    predictor_lib::predictor::MIN_REPLICAS
}

fn default_max_replicas() -> u32 {
    predictor_lib::predictor::MAX_REPLICAS
}

fn default_target_rps_per_pod() -> f64 {
    predictor_lib::predictor::DEFAULT_TARGET_RPS_PER_POD
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            prometheus_url: default_prometheus_url(),
            target_namespace: default_target_namespace(),
            target_deployment: default_target_deployment(),
            model_path: default_model_path(),
            model_metadata_path: default_model_metadata_path(),
            refresh_interval_secs: default_refresh_interval(),
            staleness_threshold_secs: None,
            fetch_timeout_secs: default_fetch_timeout(),
            window_minutes: default_window_minutes(),
            step_secs: default_step(),
            min_samples: default_min_samples(),
            min_replicas: default_min_replicas(),
            max_replicas: default_max_replicas(),
            target_rps_per_pod: default_target_rps_per_pod(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to read configuration sources")?;

        Self::from_settings(settings)
    }

    /// Deserialize and validate already-merged settings
    pub fn from_settings(settings: config::Config) -> Result<Self> {
        let config: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.prometheus_url)
            .with_context(|| format!("prometheus_url '{}' is not a valid URL", self.prometheus_url))?;

        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be greater than zero");
        }
        if self.staleness_threshold_secs == Some(0) {
            bail!("staleness_threshold_secs must be greater than zero");
        }
        if self.fetch_timeout_secs == 0 {
            bail!("fetch_timeout_secs must be greater than zero");
        }
        if self.step_secs == 0 || self.window_minutes == 0 {
            bail!("window_minutes and step_secs must be greater than zero");
        }
        if self.min_samples == 0 {
            bail!("min_samples must be at least 1");
        }
        if self.min_samples > self.window_capacity() {
            bail!(
                "min_samples ({}) exceeds the {} samples a {} minute window at {}s step can hold",
                self.min_samples,
                self.window_capacity(),
                self.window_minutes,
                self.step_secs
            );
        }
        if self.min_replicas > self.max_replicas {
            bail!(
                "min_replicas ({}) exceeds max_replicas ({})",
                self.min_replicas,
                self.max_replicas
            );
        }
        if !(self.target_rps_per_pod.is_finite() && self.target_rps_per_pod > 0.0) {
            bail!("target_rps_per_pod must be a positive number");
        }
        if self.target_namespace.is_empty() || self.target_deployment.is_empty() {
            bail!("target_namespace and target_deployment must not be empty");
        }
        Ok(())
    }

    /// Samples per series one range query returns, both ends inclusive
    pub fn window_capacity(&self) -> usize {
        (self.window_minutes * 60 / self.step_secs) as usize + 1
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(
            self.staleness_threshold_secs
                .unwrap_or(self.refresh_interval_secs * 2),
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Longest an on-demand refresh is awaited by an HTTP request
    pub fn refresh_wait(&self) -> Duration {
        self.fetch_timeout() * 2
    }

    pub fn prometheus(&self) -> PrometheusConfig {
        PrometheusConfig {
            url: self.prometheus_url.clone(),
            namespace: self.target_namespace.clone(),
            deployment: self.target_deployment.clone(),
            window: Duration::from_secs(self.window_minutes * 60),
            step: Duration::from_secs(self.step_secs),
            timeout: self.fetch_timeout(),
        }
    }

    pub fn features(&self) -> FeatureConfig {
        FeatureConfig {
            min_samples: self.min_samples,
            ..FeatureConfig::default()
        }
    }

    pub fn predictor(&self) -> PredictorConfig {
        PredictorConfig {
            output: OutputConfig {
                min_replicas: self.min_replicas,
                max_replicas: self.max_replicas,
                ..OutputConfig::default()
            },
            target_rps_per_pod: self.target_rps_per_pod,
        }
    }

    pub fn refresh(&self) -> RefreshConfig {
        RefreshConfig {
            interval: self.refresh_interval(),
            stale_grace: self.fetch_timeout(),
        }
    }
}
