//! System Report
//!
//! Loads the default classifier and prints device info, the registered apps,
//! a prediction on a random image and a short benchmark as one JSON report.

use chrono::Utc;
use clap::Parser;
use image::{DynamicImage, Rgb, RgbImage};
use ml_app_inference::{
    config::DEFAULT_CONFIG_PATH,
    models::{Availability, Device, ModelLoader},
    types::DevicePreference,
    AppConfig, Store,
};
use rand::Rng;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "system_report")]
#[command(about = "Print device, app and benchmark diagnostics as JSON")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "MLAPP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Benchmark iterations
    #[arg(short, long, default_value_t = 20)]
    iterations: usize,
}

fn random_image(size: u32) -> DynamicImage {
    let mut rng = rand::thread_rng();
    let image = RgbImage::from_fn(size, size, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]));
    DynamicImage::ImageRgb8(image)
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("system_report=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_from_path(&cli.config)?;

    let device = Device::select(DevicePreference::Auto, Availability::detect());
    let classifier = ModelLoader::new(config.model.intra_threads).load_classifier(
        &config.model,
        device,
        false,
    );
    info!(device = %device, loaded = classifier.is_loaded(), "Classifier ready");

    let apps = match Store::open(&config.database.path).and_then(|store| {
        store.migrate()?;
        store.list_active_apps()
    }) {
        Ok(apps) => apps,
        Err(e) => {
            warn!(error = %e, "Could not read app configs");
            Vec::new()
        }
    };

    let prediction = classifier
        .predict(&random_image(config.model.image_size), classifier.labels())
        .map(|p| serde_json::to_value(p).unwrap_or_default())
        .unwrap_or_else(|e| json!({ "error": e.to_string() }));

    let benchmark = classifier
        .benchmark(cli.iterations)
        .map(|r| serde_json::to_value(r).unwrap_or_default())
        .unwrap_or_else(|e| json!({ "error": e.to_string() }));

    let report = json!({
        "generated_at": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
        "device_info": classifier.device_info(),
        "apps": apps,
        "sample_prediction": prediction,
        "benchmark": benchmark,
    });

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
