//! Storage Layer
//!
//! Persists settings, call history and saved request definitions in a single
//! SQLite file opened in WAL mode behind one physical connection.

pub mod database;
pub mod error;
pub mod history;
pub mod migrate;
pub mod requests;
pub mod settings;

pub use database::{format_size, Database, DbStats, OpenOptions};
pub use error::StoreError;
pub use history::{HistoryEntry, HistoryLedger, NewHistoryEntry};
pub use migrate::{migrate, schema_snapshot, MigrationReport, SchemaSnapshot};
pub use requests::{ApiRequest, ApiRequestDraft, RequestCatalog};
pub use settings::{ClientConfig, SettingsRegistry};

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Application identifier used for directories, the store file and log files
pub const APP_NAME: &str = "API-King";

fn project_dirs() -> Result<directories::ProjectDirs, StoreError> {
    directories::ProjectDirs::from("com", "bronya0", APP_NAME)
        .ok_or_else(|| StoreError::DataDir("could not determine home directory".to_string()))
}

/// Get the application data directory, creating it if needed
pub fn get_data_dir() -> Result<PathBuf, StoreError> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory, creating it if needed
pub fn get_config_dir() -> Result<PathBuf, StoreError> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Current wall-clock time in unix milliseconds
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
