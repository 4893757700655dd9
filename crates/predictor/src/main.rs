//! Pod Predictor - predictive replica-count service
//!
//! Polls Prometheus for the target workload, predicts the replica count
//! it will need and serves that number to KEDA.

use anyhow::{Context, Result};
use pod_predictor::{
    api::{self, AppState, ServiceInfo, SERVICE_VERSION},
    config::ServiceConfig,
};
use predictor_lib::{
    cache::PredictionCache,
    collector::{MetricsSource, PrometheusSource},
    health::HealthRegistry,
    observability::{PredictorMetrics, StructuredLogger},
    predictor::{FeatureBuilder, ModelArtifact, ReplicaPredictor},
    refresh::RefreshLoop,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pod-predictor");

    let config = ServiceConfig::load()?;
    info!(
        namespace = %config.target_namespace,
        deployment = %config.target_deployment,
        prometheus_url = %config.prometheus_url,
        "Predictor configured"
    );

    let logger = StructuredLogger::new(&config.target_namespace, &config.target_deployment);
    let metrics = PredictorMetrics::new();
    let health = HealthRegistry::new(config.staleness_threshold());

    // The model must load before anything binds or spawns
    let metadata_path = config.model_metadata_path.as_path();
    let artifact = match ModelArtifact::load(&config.model_path, Some(metadata_path)) {
        Ok(artifact) => artifact,
        Err(e) => {
            error!(error = %e, code = e.code(), "Failed to load model artifact");
            return Err(e.into());
        }
    };
    logger.log_model_loaded(artifact.version(), artifact.kind(), artifact.feature_names().len());
    metrics.set_model_version(artifact.version(), artifact.kind());
    health.set_model_loaded(true).await;

    let model_version = artifact.version().to_string();
    let expected_features = artifact.feature_names().to_vec();
    let predictor = Arc::new(ReplicaPredictor::new(artifact, config.predictor()));

    let source: Arc<dyn MetricsSource> = Arc::new(
        PrometheusSource::new(config.prometheus()).context("Failed to build Prometheus client")?,
    );

    let cache = PredictionCache::new();
    let (refresh_loop, refresh_handle) = RefreshLoop::new(
        source.clone(),
        FeatureBuilder::new(config.features()),
        predictor,
        cache.clone(),
        health.clone(),
        metrics.clone(),
        logger.clone(),
        config.refresh(),
    );
    refresh_loop.register_components().await;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let refresh_task = tokio::spawn(refresh_loop.run(shutdown_tx.subscribe()));

    let state = Arc::new(AppState {
        info: ServiceInfo {
            prometheus_url: config.prometheus_url.clone(),
            target_namespace: config.target_namespace.clone(),
            target_deployment: config.target_deployment.clone(),
            model_version: model_version.clone(),
            expected_features,
            stale_after: config.refresh().stale_after(),
            refresh_wait: config.refresh_wait(),
            min_replicas: config.min_replicas,
        },
        cache,
        health,
        metrics,
        refresh: refresh_handle,
        source,
    });

    logger.log_startup(SERVICE_VERSION, &model_version, config.port);

    let server_logger = logger.clone();
    api::serve(listener, state, async move {
        let reason = shutdown_signal().await;
        server_logger.log_shutdown(reason);
    })
    .await?;

    let _ = shutdown_tx.send(());
    refresh_task.await.context("Refresh loop panicked")?;
    info!("Shutdown complete");

    Ok(())
}

/// Wait for SIGINT or SIGTERM and name the one received
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
