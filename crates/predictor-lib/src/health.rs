//! Health check infrastructure for the pod predictor
//!
//! Tracks per-component health plus the two facts readiness depends on:
//! whether the model artifact is loaded, and how long ago the metrics
//! backend was last polled successfully.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Component is experiencing issues but still operational
    Degraded,
    /// Component has failed
    Unhealthy,
}

/// Information about a component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Degraded,
            message: Some(message.into()),
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Unhealthy,
            message: Some(message.into()),
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Whether the autoscaler may rely on the served metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NotReady,
}

/// Health endpoint response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: Readiness,
    pub model_loaded: bool,
    /// Seconds since the last successful metrics fetch
    pub last_fetch_age: Option<i64>,
    pub staleness_threshold_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub components_status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    pub fn is_ready(&self) -> bool {
        self.status == Readiness::Ready
    }

    /// Compute overall status from component statuses
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

/// Component names for health tracking
pub mod components {
    pub const COLLECTOR: &str = "collector";
    pub const FEATURE_BUILDER: &str = "feature_builder";
    pub const PREDICTOR: &str = "predictor";
    pub const CACHE: &str = "cache";
}

#[derive(Debug, Default)]
struct ServiceState {
    model_loaded: bool,
    last_fetch_success: Option<i64>,
}

/// Health registry for tracking component health and readiness inputs
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    state: Arc<RwLock<ServiceState>>,
    staleness_threshold: Duration,
}

impl HealthRegistry {
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(RwLock::new(ServiceState::default())),
            staleness_threshold,
        }
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    /// Update component health status
    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    /// Mark component as healthy
    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Mark component as degraded
    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    /// Mark component as unhealthy
    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_model_loaded(&self, loaded: bool) {
        self.state.write().await.model_loaded = loaded;
    }

    /// Record a successful metrics fetch at unix time `at`
    pub async fn record_fetch_success(&self, at: i64) {
        let mut state = self.state.write().await;
        state.last_fetch_success = Some(state.last_fetch_success.map_or(at, |prev| prev.max(at)));
    }

    pub async fn last_fetch_success(&self) -> Option<i64> {
        self.state.read().await.last_fetch_success
    }

    /// Get health response at the current time
    pub async fn health(&self) -> HealthResponse {
        self.health_at(chrono::Utc::now().timestamp()).await
    }

    /// Get health response as observed at unix time `now`
    pub async fn health_at(&self, now: i64) -> HealthResponse {
        let components = self.components.read().await.clone();
        let (model_loaded, last_fetch) = {
            let state = self.state.read().await;
            (state.model_loaded, state.last_fetch_success)
        };

        let components_status = HealthResponse::compute_status(&components);
        let last_fetch_age = last_fetch.map(|ts| (now - ts).max(0));
        let threshold = self.staleness_threshold.as_secs();

        let reason = if !model_loaded {
            Some("Model not loaded".to_string())
        } else if components_status == ComponentStatus::Unhealthy {
            Some("Critical component unhealthy".to_string())
        } else {
            match last_fetch_age {
                None => Some("No successful metrics fetch yet".to_string()),
                Some(age) if age > threshold as i64 => Some(format!(
                    "Last successful metrics fetch {}s ago exceeds {}s threshold",
                    age, threshold
                )),
                Some(_) => None,
            }
        };

        HealthResponse {
            status: if reason.is_none() {
                Readiness::Ready
            } else {
                Readiness::NotReady
            },
            model_loaded,
            last_fetch_age,
            staleness_threshold_secs: threshold,
            reason,
            components_status,
            components,
        }
    }
}
