//! ML App Inference Service - Main Entry Point
//!
//! Loads app configs and classifiers, then serves the prediction API.

use anyhow::Result;
use clap::Parser;
use ml_app_inference::{
    api::{self, AppState},
    config::{AppConfig, LoggingConfig, DEFAULT_CONFIG_PATH},
    metrics::{MetricsReporter, ServiceMetrics},
    models::{Availability, ClassifierRegistry},
    storage::UploadStorage,
    PredictionService, Store,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// ML App Inference Service
#[derive(Parser, Debug)]
#[command(name = "ml-app-inference")]
#[command(version)]
#[command(about = "REST service for image classification app configs")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "MLAPP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Host to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = AppConfig::load_from_path(&cli.config)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    // Initialize logging
    init_tracing(&config.logging)?;

    info!("Starting ML App Inference Service v{}", env!("CARGO_PKG_VERSION"));
    info!(path = %cli.config.display(), "Configuration loaded");

    // Open database and seed fixtures into an empty one
    let store = Arc::new(Store::open(&config.database.path)?);
    store.migrate()?;
    if store.count_apps()? == 0 && !config.fixtures.is_empty() {
        for fixture in &config.fixtures {
            store.insert_app(fixture)?;
        }
        info!(count = config.fixtures.len(), "Seeded app configs");
    }

    let apps = store.list_active_apps()?;
    info!(
        active_apps = apps.len(),
        names = ?apps.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        "App configs loaded"
    );

    // Load one classifier per device the apps need
    let registry = Arc::new(ClassifierRegistry::build(
        &config.model,
        &apps,
        Availability::detect(),
    ));
    if !registry.default_classifier().is_loaded() {
        warn!(
            model = %config.model.model_path.display(),
            "Default model failed to load; predictions will return errors"
        );
    }

    let metrics = Arc::new(ServiceMetrics::new());
    if config.metrics.report_interval_secs > 0 {
        let reporter = MetricsReporter::new(metrics.clone(), config.metrics.report_interval_secs);
        tokio::spawn(reporter.start());
    }

    let service = PredictionService::new(
        store,
        registry,
        UploadStorage::new(&config.storage.upload_dir),
        metrics.clone(),
        config.inference.clone(),
    );
    let state = Arc::new(AppState::new(service));
    let app = api::router(state, config.server.max_upload_bytes);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Service shutting down...");
    metrics.print_summary();

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info")
            .add_directive(format!("ml_app_inference={}", logging.level).parse()?),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.with_target(false).init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
