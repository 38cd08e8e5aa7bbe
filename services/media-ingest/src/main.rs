use anyhow::{Context, Result};
use media_ingest::config::{LoggingConfig, StoreBackendKind};
use media_ingest::object_store::ObjectBackend;
use media_ingest::{
    start_api_server, AppState, Config, DerivativeGenerator, InMemoryBackend, IngestPipeline,
    JobTracker, S3Backend, StoreClient,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        video = cfg!(feature = "video"),
        "Starting media ingest service"
    );

    config.validate().context("Invalid configuration")?;

    // Initialize metrics
    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let backend: Arc<dyn ObjectBackend> = match config.store.backend {
        StoreBackendKind::S3 => Arc::new(
            S3Backend::new(&config.store)
                .await
                .context("Failed to initialize S3 backend")?,
        ),
        StoreBackendKind::Memory => {
            warn!("Using in-memory object store; stored media is lost on exit");
            Arc::new(InMemoryBackend::new(config.store.bucket.clone()))
        }
    };

    let store = Arc::new(StoreClient::new(backend, &config.store));
    let tracker = Arc::new(JobTracker::new());
    let pipeline = IngestPipeline::new(store, DerivativeGenerator::new(), tracker, &config);

    // Create API state
    let api_state = AppState {
        pipeline: pipeline.clone(),
        presigned_url_expiry: config.presigned_url_expiry(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!(
        generation_workers = config.pipeline.generation_workers,
        transfer_concurrency = config.store.transfer_concurrency,
        "Media ingest service started successfully"
    );

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down media ingest service");

    api_handle.abort();
    pipeline.shutdown().await;

    info!("Media ingest service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!("media_ingest={},tower_http=info,aws=warn", level))
    })?;

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    }

    Ok(())
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
