//! Append-only log of executed calls

use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::database::Database;
use super::error::StoreError;

/// A recorded call. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    /// Unix time supplied by the caller
    pub timestamp: i64,
    pub method: String,
    pub path: String,
    /// Opaque call description
    pub dsl: String,
}

/// A call about to be recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewHistoryEntry {
    pub timestamp: i64,
    pub method: String,
    pub path: String,
    pub dsl: String,
}

/// History ledger backed by the shared store
#[derive(Debug, Clone)]
pub struct HistoryLedger {
    db: Arc<Database>,
}

impl HistoryLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an entry and return its id
    pub fn record_history(&self, entry: &NewHistoryEntry) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO histories (time, method, path, dsl) VALUES (?1, ?2, ?3, ?4)",
                params![entry.timestamp, entry.method, entry.path, entry.dsl],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent entries first
    pub fn list_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, time, method, path, dsl FROM histories
                 ORDER BY time DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    method: row.get(2)?,
                    path: row.get(3)?,
                    dsl: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn count_history(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM histories", [], |row| row.get(0)))
    }
}
