//! API-King - desktop API testing tool, backend process
//!
//! Opens the local store, runs migrations and default seeding, starts the
//! background maintenance task and serves until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use api_king::config::{self, AppConfig, CONFIG_FILE};
use api_king::{logging, storage, ApiKingApp, VERSION};

/// API-King backend
#[derive(Parser, Debug)]
#[command(name = "api-king")]
#[command(about = "Local store and maintenance backend for the API-King desktop tool")]
struct Args {
    /// Directory holding the database and log files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not start background compaction
    #[arg(long)]
    no_maintenance: bool,

    /// Print store statistics as JSON and exit
    #[arg(long)]
    stats: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = match args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
            dir
        }
        None => storage::get_data_dir()?,
    };
    let config_path = match args.config {
        Some(path) => path,
        None => storage::get_config_dir()?.join(CONFIG_FILE),
    };

    let (mut config, origin) = config::load_or_create_config(&config_path);
    if args.no_maintenance || args.stats {
        config.maintenance.enabled = false;
    }

    // Held until exit so buffered file logs are flushed.
    let _log_guard = logging::init(&config.logging, &data_dir)?;

    info!(version = VERSION, "API-King starting");
    origin.log(&config_path);
    info!(
        config = %config_path.display(),
        data_dir = %data_dir.display(),
        "paths resolved"
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(run(config, data_dir, args.stats))
}

async fn run(config: AppConfig, data_dir: PathBuf, print_stats: bool) -> Result<()> {
    let db_path = data_dir.join(&config.storage.file_name);

    let app = match ApiKingApp::start(&config, &db_path) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %format!("{e:#}"), "backend startup failed, cannot continue");
            return Err(e);
        }
    };

    if print_stats {
        let report = serde_json::json!({
            "app": app.app_name(),
            "version": app.version(),
            "db_path": app.database().path().display().to_string(),
            "stats": app.db_stats()?,
            "config": app.settings().client_config(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        app.shutdown().await;
        return Ok(());
    }

    info!("backend ready, press Ctrl-C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    app.shutdown().await;
    info!("API-King shutdown complete");

    Ok(())
}
