//! Forward-only schema migration
//!
//! Runs on every startup. Each table is created if missing, gains any column it
//! lacks, and gets its indexes. Nothing is ever dropped or renamed, so running
//! the migration any number of times converges on the same schema.

use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info};

use super::database::Database;
use super::error::StoreError;

/// A column in the logical schema
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    /// Type and constraints used when the table is created
    pub definition: &'static str,
    /// Definition used when the column is added to an existing table.
    /// `ALTER TABLE ADD COLUMN` cannot add PRIMARY KEY or UNIQUE columns and
    /// needs a default for NOT NULL ones.
    pub add_definition: &'static str,
}

/// An index in the logical schema
#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

/// A table in the logical schema
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    pub indexes: &'static [IndexSpec],
    /// Data fixes run after the columns exist. Each must be a no-op on rows
    /// already in the current format.
    pub normalize: &'static [&'static str],
}

const fn col(
    name: &'static str,
    definition: &'static str,
    add_definition: &'static str,
) -> ColumnSpec {
    ColumnSpec {
        name,
        definition,
        add_definition,
    }
}

/// Older stores kept request timestamps as datetime text
/// (`2025-03-01 10:00:00.123+08:00`). Rewrite those as unix milliseconds; text
/// SQLite cannot parse becomes 0.
macro_rules! legacy_timestamp {
    ($table:literal, $column:literal) => {
        concat!(
            "UPDATE \"", $table, "\" SET \"", $column, "\" = CASE typeof(\"", $column, "\") ",
            "WHEN 'text' THEN COALESCE(CAST(ROUND((julianday(\"", $column, "\") - 2440587.5) ",
            "* 86400000.0) AS INTEGER), 0) ",
            "WHEN 'real' THEN CAST(\"", $column, "\" AS INTEGER) ",
            "ELSE 0 END ",
            "WHERE typeof(\"", $column, "\") <> 'integer'"
        )
    };
}

/// The current logical schema
pub const SCHEMA: &[TableSpec] = &[
    TableSpec {
        name: "settings",
        columns: &[
            col("key", "TEXT PRIMARY KEY NOT NULL", "TEXT"),
            col("value", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
        ],
        indexes: &[],
        normalize: &[],
    },
    TableSpec {
        name: "histories",
        columns: &[
            col("id", "INTEGER PRIMARY KEY AUTOINCREMENT", "INTEGER"),
            col("time", "INTEGER NOT NULL DEFAULT 0", "INTEGER NOT NULL DEFAULT 0"),
            col("method", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("path", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("dsl", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
        ],
        indexes: &[IndexSpec {
            name: "idx_histories_time",
            columns: &["time"],
            unique: false,
        }],
        normalize: &[],
    },
    TableSpec {
        name: "api",
        columns: &[
            col("id", "INTEGER PRIMARY KEY AUTOINCREMENT", "INTEGER"),
            col("group_name", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("api_name", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("method", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("url", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("headers", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("params", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("type", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("body", "TEXT NOT NULL DEFAULT ''", "TEXT NOT NULL DEFAULT ''"),
            col("created_at", "INTEGER NOT NULL DEFAULT 0", "INTEGER NOT NULL DEFAULT 0"),
            col("updated_at", "INTEGER NOT NULL DEFAULT 0", "INTEGER NOT NULL DEFAULT 0"),
        ],
        indexes: &[IndexSpec {
            name: "idx_uni",
            columns: &["group_name", "api_name", "method", "url"],
            unique: true,
        }],
        normalize: &[
            legacy_timestamp!("api", "created_at"),
            legacy_timestamp!("api", "updated_at"),
        ],
    },
];

/// Outcome of a migration run
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Tables that did not exist before this run
    pub tables_created: Vec<&'static str>,
    /// `table.column` entries added to pre-existing tables
    pub columns_added: Vec<String>,
    /// Rows rewritten from an older storage format
    pub rows_normalized: usize,
    /// Tables whose migration failed, with the cause
    pub failures: Vec<(&'static str, rusqlite::Error)>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// First failure as an error, for callers that treat migration as fatal
    pub fn into_result(mut self) -> Result<Self, StoreError> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        let (table, source) = self.failures.swap_remove(0);
        Err(StoreError::Migration { table, source })
    }
}

/// Tables → columns and indexes, as found on disk
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableSnapshot>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    pub columns: Vec<String>,
    /// Index name → (unique, sql)
    pub indexes: BTreeMap<String, (bool, Option<String>)>,
}

/// Bring the on-disk schema in line with [`SCHEMA`].
///
/// `PRAGMA foreign_keys = ON` is reasserted first. Tables migrate independently:
/// a failure is recorded in the report and the remaining tables still run.
pub fn migrate(db: &Database) -> MigrationReport {
    migrate_tables(db, SCHEMA)
}

pub(crate) fn migrate_tables(db: &Database, tables: &[TableSpec]) -> MigrationReport {
    let mut report = MigrationReport::default();

    if let Err(e) = db.exec("PRAGMA foreign_keys = ON;") {
        error!(error = %e, "failed to enable foreign keys before migration");
    }

    for table in tables {
        let result = {
            let mut conn = db.lock();
            migrate_in_transaction(&mut conn, table)
        };

        match result {
            Ok(TableOutcome {
                created,
                added,
                normalized,
            }) => {
                if created {
                    info!(table = table.name, "created table");
                    report.tables_created.push(table.name);
                }
                for column in added {
                    info!(table = table.name, column, "added column");
                    report.columns_added.push(format!("{}.{}", table.name, column));
                }
                if normalized > 0 {
                    info!(table = table.name, rows = normalized, "normalized legacy rows");
                    report.rows_normalized += normalized;
                }
            }
            Err(e) => {
                error!(table = table.name, error = %e, "schema migration failed");
                report.failures.push((table.name, e));
            }
        }
    }

    debug!(?report, "migration finished");
    report
}

struct TableOutcome {
    created: bool,
    added: Vec<&'static str>,
    normalized: usize,
}

fn migrate_in_transaction(
    conn: &mut Connection,
    table: &TableSpec,
) -> rusqlite::Result<TableOutcome> {
    let tx = conn.transaction()?;
    let outcome = migrate_table(&tx, table)?;
    tx.commit()?;
    Ok(outcome)
}

fn migrate_table(conn: &Connection, table: &TableSpec) -> rusqlite::Result<TableOutcome> {
    let existing = table_columns(conn, table.name)?;
    let created = existing.is_empty();
    let mut added = Vec::new();

    if created {
        let columns = table
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.definition))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({});",
            table.name, columns
        ))?;
    } else {
        let existing: BTreeSet<String> =
            existing.into_iter().map(|c| c.to_lowercase()).collect();
        for column in table.columns {
            if existing.contains(&column.name.to_lowercase()) {
                continue;
            }
            conn.execute_batch(&format!(
                "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {};",
                table.name, column.name, column.add_definition
            ))?;
            added.push(column.name);
        }
    }

    for index in table.indexes {
        let columns = index
            .columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "CREATE {}INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({});",
            if index.unique { "UNIQUE " } else { "" },
            index.name,
            table.name,
            columns
        ))?;
    }

    let mut normalized = 0;
    for sql in table.normalize {
        normalized += conn.execute(sql, [])?;
    }

    Ok(TableOutcome {
        created,
        added,
        normalized,
    })
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |row| row.get::<_, String>(0))?;
    rows.collect()
}

/// Read the current on-disk schema of all user tables
pub fn schema_snapshot(db: &Database) -> Result<SchemaSnapshot, StoreError> {
    db.with_conn(|conn| {
        let mut snapshot = SchemaSnapshot::default();
        let names: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for name in names {
            let columns = table_columns(conn, &name)?;
            let mut indexes = BTreeMap::new();
            let mut stmt = conn.prepare(
                "SELECT il.name, il.\"unique\", m.sql
                 FROM pragma_index_list(?1) AS il
                 LEFT JOIN sqlite_master AS m ON m.type = 'index' AND m.name = il.name",
            )?;
            let rows = stmt.query_map([&name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            for row in rows {
                let (index, unique, sql) = row?;
                indexes.insert(index, (unique, sql));
            }
            snapshot
                .tables
                .insert(name, TableSnapshot { columns, indexes });
        }

        Ok(snapshot)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("migrate.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_fresh_store_gets_all_tables() {
        let (_dir, db) = open_temp();

        let report = migrate(&db);

        assert!(report.is_clean());
        assert_eq!(report.tables_created, vec!["settings", "histories", "api"]);
        assert!(report.columns_added.is_empty());

        let snapshot = schema_snapshot(&db).unwrap();
        let api = &snapshot.tables["api"];
        assert_eq!(api.columns.len(), 11);
        assert_eq!(api.indexes.get("idx_uni").map(|(u, _)| *u), Some(true));
        assert_eq!(snapshot.tables["settings"].columns, vec!["key", "value"]);
    }

    #[test]
    fn test_migration_is_idempotent() {
        let (_dir, db) = open_temp();

        let first = migrate(&db);
        let once = schema_snapshot(&db).unwrap();

        for _ in 0..3 {
            let again = migrate(&db);
            assert!(again.is_clean());
            assert!(again.tables_created.is_empty());
            assert!(again.columns_added.is_empty());
            assert_eq!(again.rows_normalized, 0);
        }

        assert!(first.is_clean());
        assert_eq!(schema_snapshot(&db).unwrap(), once);
    }

    #[test]
    fn test_adds_missing_columns_without_touching_data() {
        let (_dir, db) = open_temp();
        db.exec(
            "CREATE TABLE api (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_name TEXT, api_name TEXT, method TEXT, url TEXT,
                legacy_note TEXT
             );
             INSERT INTO api (group_name, api_name, method, url, legacy_note)
             VALUES ('g', 'n', 'GET', 'http://x', 'keep me');",
        )
        .unwrap();

        let report = migrate(&db);

        assert!(report.is_clean());
        assert_eq!(report.tables_created, vec!["settings", "histories"]);
        assert!(report.columns_added.contains(&"api.body".to_string()));
        assert!(report.columns_added.contains(&"api.updated_at".to_string()));

        let snapshot = schema_snapshot(&db).unwrap();
        let api = &snapshot.tables["api"];
        assert!(api.columns.contains(&"legacy_note".to_string()));
        assert!(api.columns.contains(&"type".to_string()));
        assert!(api.indexes.contains_key("idx_uni"));

        let (note, body): (String, String) = db
            .with_conn(|conn| {
                conn.query_row("SELECT legacy_note, body FROM api", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
            })
            .unwrap();
        assert_eq!(note, "keep me");
        assert_eq!(body, "");
    }

    #[test]
    fn test_legacy_datetime_text_becomes_millis() {
        let (_dir, db) = open_temp();
        db.exec(
            "CREATE TABLE `api` (`id` integer PRIMARY KEY AUTOINCREMENT,`group_name` text,
                `api_name` text,`method` text,`url` text,`headers` text,`params` text,
                `type` text,`body` text,`created_at` datetime,`updated_at` datetime);
             CREATE UNIQUE INDEX `idx_uni` ON `api`(`group_name`,`api_name`,`method`,`url`);
             INSERT INTO api (group_name, api_name, method, url, headers, params, type, body,
                              created_at, updated_at)
             VALUES ('g', 'a', 'GET', 'http://h/a', '', '', '', '',
                     '2025-03-01 10:00:00.123+08:00', '2025-03-02 08:30:00+08:00'),
                    ('g', 'b', 'GET', 'http://h/b', '', '', '', '', 'garbage', NULL);",
        )
        .unwrap();

        let report = migrate(&db);
        assert!(report.is_clean());
        assert_eq!(report.rows_normalized, 4);

        let rows: Vec<(i64, i64)> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT created_at, updated_at FROM api ORDER BY id")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect()
            })
            .unwrap();
        assert_eq!(rows, vec![(1_740_794_400_123, 1_740_875_400_000), (0, 0)]);

        assert_eq!(migrate(&db).rows_normalized, 0);
    }

    #[test]
    fn test_failing_table_does_not_block_others() {
        let (_dir, db) = open_temp();
        // Duplicate rows make the unique index impossible to build.
        db.exec(
            "CREATE TABLE api (group_name TEXT, api_name TEXT, method TEXT, url TEXT);
             INSERT INTO api VALUES ('g', 'n', 'GET', 'u'), ('g', 'n', 'GET', 'u');",
        )
        .unwrap();

        let report = migrate(&db);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "api");
        assert!(report.tables_created.contains(&"settings"));
        assert!(report.tables_created.contains(&"histories"));

        // The failed table's transaction rolled back: no half-added columns.
        let snapshot = schema_snapshot(&db).unwrap();
        assert_eq!(snapshot.tables["api"].columns.len(), 4);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, StoreError::Migration { table: "api", .. }));
        assert!(std::error::Error::source(&err).is_some());
    }
}
