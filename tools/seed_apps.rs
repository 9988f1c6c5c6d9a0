//! Demo App Seeder
//!
//! Clears the app config table and recreates the three demo apps.

use clap::Parser;
use ml_app_inference::{config::DEFAULT_CONFIG_PATH, types::NewMlApp, AppConfig, Store};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "seed_apps")]
#[command(about = "Recreate the demo ML app configs")]
struct Cli {
    /// Configuration file naming the database
    #[arg(short, long, env = "MLAPP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Database path (overrides database.path)
    #[arg(long)]
    database: Option<String>,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("seed_apps=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_from_path(&cli.config)?;
    let database = cli.database.unwrap_or(config.database.path);

    let store = Store::open(&database)?;
    store.migrate()?;

    let removed = store.clear_apps()?;
    info!(database = %database, removed, "Cleared existing app configs");

    for app in NewMlApp::demo_set() {
        let created = store.insert_app(&app)?;
        info!(
            id = created.id,
            name = %created.name,
            device = %created.device_type,
            batch_size = created.batch_size,
            mixed_precision = created.use_mixed_precision,
            classes = ?created.classes,
            "Created app config"
        );
    }

    info!(total = store.count_apps()?, "Demo apps seeded");
    Ok(())
}
