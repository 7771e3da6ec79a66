//! Application Configuration
//!
//! Operational settings stored in TOML format. User-facing preferences (theme,
//! auto start, ...) live in the store's settings table instead.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::maintenance::{MaintenanceSchedule, MAX_PERIOD};
use crate::storage::APP_NAME;
use crate::transport::HttpPoolConfig;

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Store settings
    pub storage: StorageConfig,
    /// Background maintenance settings
    pub maintenance: MaintenanceConfig,
    /// Outbound HTTP pool settings
    pub http: HttpConfig,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Extra settings seeded into the store on first run
    pub defaults: BTreeMap<String, String>,
}

/// Store-related settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file name inside the data directory
    pub file_name: String,
    /// Wait this long on locks held by other processes (0 = fail immediately)
    pub busy_timeout_ms: u64,
    /// Abort startup when a schema migration fails
    pub strict_migrations: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_name: format!("{APP_NAME}.db"),
            busy_timeout_ms: 0,
            strict_migrations: false,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Option<Duration> {
        (self.busy_timeout_ms > 0).then(|| Duration::from_millis(self.busy_timeout_ms))
    }
}

/// Maintenance scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Run the background compaction task
    pub enabled: bool,
    /// Seconds after startup for the first pass
    pub initial_delay_secs: u64,
    /// Seconds between recurring passes
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        let schedule = MaintenanceSchedule::default();
        Self {
            enabled: true,
            initial_delay_secs: schedule.initial_delay.as_secs(),
            interval_secs: schedule.interval.as_secs(),
        }
    }
}

impl MaintenanceConfig {
    pub fn schedule(&self) -> MaintenanceSchedule {
        MaintenanceSchedule {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            interval: Duration::from_secs(self.interval_secs),
        }
    }
}

/// Outbound HTTP settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub max_idle_per_host: usize,
    pub max_conns_per_host: usize,
    pub idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub keep_alive: bool,
    /// Skip TLS certificate verification
    pub accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let pool = HttpPoolConfig::default();
        Self {
            max_idle_per_host: pool.max_idle_per_host,
            max_conns_per_host: pool.max_conns_per_host,
            idle_timeout_secs: pool.idle_timeout.as_secs(),
            request_timeout_secs: pool.request_timeout.as_secs(),
            keep_alive: pool.keep_alive,
            accept_invalid_certs: pool.accept_invalid_certs,
        }
    }
}

impl HttpConfig {
    pub fn pool_config(&self) -> HttpPoolConfig {
        HttpPoolConfig {
            max_idle_per_host: self.max_idle_per_host,
            max_conns_per_host: self.max_conns_per_host,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            keep_alive: self.keep_alive,
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Also write daily-rotated log files under `<data dir>/logs`
    pub file_enabled: bool,
    /// Number of rotated log files to keep
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: true,
            max_files: 7,
        }
    }
}

impl AppConfig {
    /// Reject values the components cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.storage.file_name.trim().is_empty() {
            anyhow::bail!("storage.file_name must not be empty");
        }
        if self.maintenance.interval_secs == 0 {
            anyhow::bail!("maintenance.interval_secs must be greater than zero");
        }
        let max_secs = MAX_PERIOD.as_secs();
        if self.maintenance.interval_secs > max_secs {
            anyhow::bail!("maintenance.interval_secs must be at most {max_secs}");
        }
        if self.maintenance.initial_delay_secs > max_secs {
            anyhow::bail!("maintenance.initial_delay_secs must be at most {max_secs}");
        }
        if self.http.max_conns_per_host == 0 {
            anyhow::bail!("http.max_conns_per_host must be greater than zero");
        }
        if self.logging.max_files == 0 {
            anyhow::bail!("logging.max_files must be greater than zero");
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Where [`load_or_create_config`] got its configuration from
#[derive(Debug)]
pub enum ConfigOrigin {
    /// Read from the existing file
    Loaded,
    /// No file existed; defaults were written to it
    Created,
    /// No file existed and the defaults could not be written
    CreateFailed(anyhow::Error),
    /// The existing file was unreadable or invalid and was left untouched
    Rejected(anyhow::Error),
}

impl ConfigOrigin {
    /// Report the outcome. Call once logging is installed.
    pub fn log(&self, path: &Path) {
        match self {
            ConfigOrigin::Loaded => info!("Loaded configuration from {:?}", path),
            ConfigOrigin::Created => info!("Wrote default configuration to {:?}", path),
            ConfigOrigin::CreateFailed(e) => {
                warn!("Could not write default configuration to {:?}: {:#}", path, e)
            }
            ConfigOrigin::Rejected(e) => {
                warn!("Ignoring configuration at {:?}, using defaults: {:#}", path, e)
            }
        }
    }
}

/// Load configuration from file, writing the defaults on first run.
///
/// An unreadable or invalid file is left untouched and the defaults are used.
/// Nothing is logged here; report the returned [`ConfigOrigin`] once logging
/// is installed.
pub fn load_or_create_config(path: &Path) -> (AppConfig, ConfigOrigin) {
    if path.exists() {
        return match load_config(path) {
            Ok(config) => (config, ConfigOrigin::Loaded),
            Err(e) => (AppConfig::default(), ConfigOrigin::Rejected(e)),
        };
    }

    let config = AppConfig::default();
    let origin = match save_config(&config, path) {
        Ok(()) => ConfigOrigin::Created,
        Err(e) => ConfigOrigin::CreateFailed(e),
    };
    (config, origin)
}
