//! Application Coordinator
//!
//! Owns the store and every component layered on it, and runs the startup
//! sequence: open store, migrate, seed default settings, start maintenance.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::maintenance::{self, MaintenanceHandle, MaintenanceStats};
use crate::storage::settings::builtin_defaults;
use crate::storage::{
    self, Database, DbStats, HistoryLedger, MigrationReport, OpenOptions, RequestCatalog,
    SettingsRegistry, APP_NAME,
};
use crate::transport::PooledTransport;

/// Application version baked in at build time
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main application coordinator
pub struct ApiKingApp {
    db: Arc<Database>,
    settings: SettingsRegistry,
    history: HistoryLedger,
    requests: RequestCatalog,
    transport: PooledTransport,
    migration: MigrationReport,
    maintenance: Option<MaintenanceHandle>,
}

impl ApiKingApp {
    /// Bring up the backend with the store at `db_path`.
    ///
    /// Maintenance is spawned on the current tokio runtime; outside one, this
    /// fails before touching the store unless maintenance is disabled. Use
    /// [`ApiKingApp::start_on`] to pick the runtime explicitly.
    pub fn start(config: &AppConfig, db_path: &Path) -> Result<Self> {
        let runtime = if config.maintenance.enabled {
            Some(Handle::try_current().context("Background maintenance needs a tokio runtime")?)
        } else {
            None
        };
        Self::start_inner(config, db_path, runtime.as_ref())
    }

    /// Like [`ApiKingApp::start`], spawning maintenance on `runtime`
    pub fn start_on(config: &AppConfig, db_path: &Path, runtime: &Handle) -> Result<Self> {
        Self::start_inner(config, db_path, Some(runtime))
    }

    /// Fails only when the store cannot be opened, or when a migration fails
    /// with `strict_migrations` set.
    fn start_inner(config: &AppConfig, db_path: &Path, runtime: Option<&Handle>) -> Result<Self> {
        info!("=== backend services starting ===");

        let options = OpenOptions {
            busy_timeout: config.storage.busy_timeout(),
        };
        let db = Arc::new(
            Database::open_with(db_path, &options)
                .with_context(|| format!("Failed to open store at {}", db_path.display()))?,
        );

        let mut migration = storage::migrate(&db);
        if config.storage.strict_migrations {
            migration = migration.into_result()?;
        }
        if !migration.is_clean() {
            error!(
                failures = migration.failures.len(),
                "schema migration incomplete, continuing with existing schema"
            );
        }

        let settings = SettingsRegistry::new(db.clone());
        let mut defaults = builtin_defaults();
        defaults.extend(config.defaults.clone());
        if let Err(e) = settings.init_defaults(&defaults) {
            warn!(error = %e, "failed to seed default settings");
        }

        let transport = PooledTransport::new(config.http.pool_config())?;

        let maintenance = runtime
            .filter(|_| config.maintenance.enabled)
            .map(|runtime| {
                maintenance::start(
                    runtime,
                    db.clone(),
                    config.maintenance.schedule(),
                    CancellationToken::new(),
                )
            });
        if maintenance.is_none() {
            info!("background maintenance disabled");
        }

        Ok(Self {
            history: HistoryLedger::new(db.clone()),
            requests: RequestCatalog::new(db.clone()),
            db,
            settings,
            transport,
            migration,
            maintenance,
        })
    }

    /// Start with the store in the default data directory
    pub fn start_default(config: &AppConfig) -> Result<Self> {
        let data_dir = storage::get_data_dir()?;
        Self::start(config, &data_dir.join(&config.storage.file_name))
    }

    pub fn settings(&self) -> &SettingsRegistry {
        &self.settings
    }

    pub fn history(&self) -> &HistoryLedger {
        &self.history
    }

    pub fn requests(&self) -> &RequestCatalog {
        &self.requests
    }

    pub fn transport(&self) -> &PooledTransport {
        &self.transport
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// What the startup migration did
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    pub fn maintenance_stats(&self) -> Option<MaintenanceStats> {
        self.maintenance.as_ref().map(|m| m.stats())
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn app_name(&self) -> &'static str {
        APP_NAME
    }

    /// Directory holding the store file
    pub fn db_dir(&self) -> PathBuf {
        self.db.dir().to_path_buf()
    }

    pub fn db_stats(&self) -> Result<DbStats> {
        Ok(self.db.stats()?)
    }

    /// Stop background maintenance at its next idle point
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.maintenance.take() {
            handle.shutdown().await;
        }
        info!("backend services stopped");
    }
}
