//! Storage error type

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the embedded store and the components layered on it
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database file could not be created or opened
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    /// The directory for the database file could not be created
    #[error("failed to create store directory {path}: {source}")]
    OpenDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A pragma did not take the expected value after being set
    #[error("pragma {pragma} expected {expected}, got {actual}")]
    Pragma {
        pragma: &'static str,
        expected: String,
        actual: String,
    },
    /// Migration of a single table failed
    #[error("migration of table {table} failed: {source}")]
    Migration {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    /// Any other SQLite failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Filesystem failure (data directory, file metadata)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Platform directories could not be resolved
    #[error("data directory unavailable: {0}")]
    DataDir(String),
}

impl StoreError {
    /// Whether this error means the store cannot be used at all
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Open { .. } | StoreError::OpenDir { .. } | StoreError::Pragma { .. }
        )
    }
}
