use anyhow::{Context, Result};
use darkroom_pipeline::config::Config;
use darkroom_pipeline::filter_api::{start_api_server, AppState};
use darkroom_pipeline::kafka::IngressBridge;
use darkroom_pipeline::mailer::HttpMailer;
use darkroom_pipeline::object_store::S3ObjectStore;
use darkroom_pipeline::pipeline::{Capabilities, Pipeline};
use darkroom_pipeline::record::PgRecordStore;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Darkroom pipeline service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize capabilities
    let records = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    if config.database.run_migrations {
        records
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let objects = Arc::new(S3ObjectStore::new(&config.s3).await);
    let mail = Arc::new(HttpMailer::new(&config.mailer));

    // Wire up the topic, queues, and handlers
    let pipeline = Pipeline::build(
        Capabilities {
            records: records.clone(),
            objects,
            mailer: mail,
        },
        config.queue_settings(),
        config.mailer.fallback_address.clone(),
    );

    // Spawn the Kafka ingress bridge
    let bridge = IngressBridge::new(&config.kafka, pipeline.topic.clone())
        .context("Failed to initialize ingress bridge")?;
    let bridge_handle = tokio::spawn(async move {
        if let Err(e) = bridge.run().await {
            error!(error = %e, "Ingress bridge error");
        }
    });

    // Spawn the filter API server
    let api_state = AppState { records };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "Filter API server error");
        }
    });

    info!("Pipeline service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down pipeline service");

    bridge_handle.abort();
    api_handle.abort();
    pipeline.shutdown();
    pipeline.join().await;

    info!("Pipeline service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
