//! API client for communicating with the pod predictor service

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

/// Errors returned by the predictor API
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to reach {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("API error ({status}): {message}")]
    Api {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },

    #[error("failed to parse response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// API client for the predictor service
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Make a GET request; `accept` lists non-2xx statuses whose body is still parsed as `T`
    async fn get_accepting<T: DeserializeOwned>(
        &self,
        path: &str,
        accept: &[StatusCode],
    ) -> Result<(StatusCode, T), ClientError> {
        let url = self.base_url.join(path).map_err(|e| ClientError::Api {
            status: StatusCode::BAD_REQUEST,
            code: None,
            message: format!("invalid path '{path}': {e}"),
        })?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() && !accept.contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => ClientError::Api {
                    status,
                    message: match err.details {
                        Some(details) => format!("{}: {}", err.error, details),
                        None => err.error,
                    },
                    code: Some(err.code),
                },
                Err(_) => ClientError::Api {
                    status,
                    code: None,
                    message: body,
                },
            });
        }

        let body = response
            .json()
            .await
            .map_err(|source| ClientError::Decode {
                url: url.to_string(),
                source,
            })?;
        Ok((status, body))
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.get_accepting(path, &[]).await.map(|(_, body)| body)
    }

    /// Readiness report; a 503 is a valid answer, not an error
    pub async fn health(&self) -> Result<HealthReport, ClientError> {
        self.get_accepting("health", &[StatusCode::SERVICE_UNAVAILABLE])
            .await
            .map(|(_, body)| body)
    }

    pub async fn prediction(&self, refresh: bool, features: bool) -> Result<PredictionReport, ClientError> {
        let mut params = Vec::new();
        if refresh {
            params.push("refresh=true");
        }
        if features {
            params.push("include_features=true");
        }
        let path = if params.is_empty() {
            "predict-from-prometheus".to_string()
        } else {
            format!("predict-from-prometheus?{}", params.join("&"))
        };
        self.get(&path).await
    }

    pub async fn scaler_metric(&self) -> Result<ScalerMetric, ClientError> {
        self.get("keda-metric").await
    }

    pub async fn current_metrics(&self) -> Result<CurrentMetrics, ClientError> {
        self.get("current-metrics").await
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub model_loaded: bool,
    pub last_fetch_age: Option<i64>,
    pub staleness_threshold_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub components_status: String,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub features: Vec<Feature>,
    pub window_start: i64,
    pub window_end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionReport {
    pub predicted_pod_count: u32,
    pub confidence: f64,
    pub model_version: String,
    pub timestamp: String,
    pub stale: bool,
    #[serde(default)]
    pub metrics_used: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureVector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalerMetric {
    pub metric_name: String,
    pub metric_value: u32,
    pub timestamp: String,
    pub stale: bool,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentMetrics {
    pub metrics: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub missing: Vec<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
