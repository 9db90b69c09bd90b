use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use variant_pipeline::api::{start_api_server, AppState};
use variant_pipeline::{
    Config, HttpMetadataNotifier, NotificationConsumer, S3ObjectStore, VariantPipeline,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting variant pipeline service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Clients and lookup tables are built once and shared by every invocation
    let store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );
    let notifier = Arc::new(
        HttpMetadataNotifier::new(&config.notifier)
            .context("Failed to initialize metadata notifier")?,
    );
    let profiles = config.profile_table()?;
    let environments = config.environment_table()?;

    if environments.is_empty() {
        warn!("No environments configured; metadata updates will fail");
    }

    info!(
        profiles = profiles.profiles().len(),
        environments = environments.len(),
        policy = ?config.pipeline.partial_write_policy,
        "Lookup tables loaded"
    );

    let pipeline = Arc::new(
        VariantPipeline::new(store, notifier, profiles, environments)
            .with_partial_write_policy(config.pipeline.partial_write_policy),
    );

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    // Spawn Kafka consumer task
    if config.kafka.enabled {
        let consumer = NotificationConsumer::new(&config.kafka, pipeline.clone())
            .context("Failed to initialize Kafka consumer")?;
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = consumer.run(token).await {
                error!(error = %e, "Kafka consumer error");
            }
        }));
    }

    // Spawn API server task
    if config.api.enabled {
        let api_config = config.api.clone();
        let state = AppState {
            pipeline: pipeline.clone(),
        };
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = start_api_server(state, &api_config, token).await {
                error!(error = %e, "API server error");
            }
        }));
    }

    if handles.is_empty() {
        anyhow::bail!("Neither kafka nor api delivery is enabled");
    }

    info!("Variant pipeline service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down variant pipeline service");

    // In-flight invocations finish before their task returns
    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Task failed during shutdown");
        }
    }

    info!("Variant pipeline service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
