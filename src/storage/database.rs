//! SQLite database for persistent storage
//!
//! The store owns exactly one physical connection for its whole lifetime.
//! WAL only guarantees single-writer correctness when every write goes through
//! the same handle, so there is no pool: readers, writers and compaction all
//! serialize on the connection mutex.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::error::StoreError;

/// Tables counted by [`Database::stats`]
const COUNTED_TABLES: [&str; 3] = ["settings", "histories", "api"];

/// Options applied when the store is opened
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// SQLite busy timeout for locks held by other processes.
    /// `None` keeps SQLite's default of failing immediately on an external lock;
    /// in-process contention always waits on the connection mutex.
    pub busy_timeout: Option<Duration>,
}

/// Size and row statistics for the store file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbStats {
    pub total_rows: i64,
    pub file_size: i64,
    pub size_str: String,
}

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open or create database at path with default options
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with(path, &OpenOptions::default())
    }

    /// Open or create database at path.
    ///
    /// Equivalent to `cache=shared&mode=rwc&_journal_mode=WAL`. Any failure here
    /// is fatal to the caller: there is no degraded mode without persistence.
    pub fn open_with(path: &Path, options: &OpenOptions) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::OpenDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_SHARED_CACHE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        apply_pragmas(&conn, path, options)?;

        info!(path = %path.display(), "store opened in WAL mode");

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Path of the main database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the database file
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Exclusive access to the connection for callers that need the raw
    /// rusqlite error
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run a closure against the single connection.
    ///
    /// Blocks until the connection is free, which includes waiting out an
    /// in-progress compaction.
    pub fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.lock();
        Ok(f(&conn)?)
    }

    /// Like [`Database::with_conn`] but with mutable access, for transactions
    pub fn with_conn_mut<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self.lock();
        Ok(f(&mut conn)?)
    }

    /// Execute one or more statements that return no rows
    pub fn exec(&self, sql: &str) -> Result<(), StoreError> {
        debug!(sql, "exec");
        self.with_conn(|conn| conn.execute_batch(sql))
    }

    /// Rebuild the database file, reclaiming pages freed by deletes and updates.
    ///
    /// Holds the connection for the whole pass; concurrent callers wait.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.exec("VACUUM;")
    }

    /// Current journal mode as reported by SQLite
    pub fn journal_mode(&self) -> Result<String, StoreError> {
        self.with_conn(|conn| conn.query_row("PRAGMA journal_mode;", [], |row| row.get(0)))
    }

    /// Run SQLite's integrity check; true when the file is consistent
    pub fn integrity_check(&self) -> Result<bool, StoreError> {
        let result: String =
            self.with_conn(|conn| conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0)))?;
        Ok(result == "ok")
    }

    /// Row count across the application tables and on-disk size (main file + WAL)
    pub fn stats(&self) -> Result<DbStats, StoreError> {
        let total_rows = self.with_conn(|conn| {
            let mut total = 0i64;
            for table in COUNTED_TABLES {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    [table],
                    |row| row.get(0),
                )?;
                if exists {
                    let count: i64 = conn.query_row(
                        &format!("SELECT COUNT(*) FROM \"{table}\""),
                        [],
                        |row| row.get(0),
                    )?;
                    total += count;
                }
            }
            Ok(total)
        })?;

        let mut file_size = std::fs::metadata(&self.path)?.len() as i64;
        let mut wal = self.path.clone().into_os_string();
        wal.push("-wal");
        if let Ok(meta) = std::fs::metadata(PathBuf::from(wal)) {
            file_size += meta.len() as i64;
        }

        Ok(DbStats {
            total_rows,
            file_size,
            size_str: format_size(file_size),
        })
    }
}

fn apply_pragmas(conn: &Connection, path: &Path, options: &OpenOptions) -> Result<(), StoreError> {
    let open_err = |source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    };

    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(open_err)?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(StoreError::Pragma {
            pragma: "journal_mode",
            expected: "wal".to_string(),
            actual: mode,
        });
    }

    // No cross-table references exist yet; enforced for future schema growth.
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(open_err)?;

    if let Some(timeout) = options.busy_timeout {
        conn.busy_timeout(timeout).map_err(open_err)?;
    }

    debug!(journal_mode = %mode, "store pragmas applied");
    Ok(())
}

/// Human readable byte size, e.g. `1.50 KB`
pub fn format_size(size: i64) -> String {
    if size < 0 {
        return format!("-{}", format_size(size.saturating_neg()));
    }
    const UNIT: i64 = 1024;
    if size < UNIT {
        return format!("{} B", size);
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = size / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.2} {}B", size as f64 / div as f64, suffix)
}
