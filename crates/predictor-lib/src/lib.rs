//! Predictive pod-count autoscaling library
//!
//! This crate provides the core functionality for:
//! - Metrics collection from a Prometheus-compatible backend
//! - Feature extraction over the recent sample window
//! - Replica-count inference with confidence scoring
//! - A single-writer prediction cache fed by a periodic refresh loop
//! - Health checks and observability

pub mod cache;
pub mod collector;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod refresh;

pub use cache::{CacheEntry, MetricsSnapshot, PredictionCache};
pub use error::{PredictorError, Result};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, Readiness};
pub use models::*;
pub use observability::{PredictorMetrics, StructuredLogger};
pub use refresh::{CycleOutcome, RefreshConfig, RefreshHandle, RefreshLoop};
