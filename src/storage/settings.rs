//! Key/value settings layered on the `settings` table

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::database::Database;
use super::error::StoreError;

/// Theme used when none has been saved
pub const DEFAULT_THEME: &str = "dark";

/// Built-in defaults seeded on first run
pub fn builtin_defaults() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("theme".to_string(), DEFAULT_THEME.to_string()),
        ("auto_start".to_string(), "false".to_string()),
    ])
}

/// Settings the GUI reads at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub theme: String,
    pub auto_start: bool,
}

/// Settings registry backed by the shared store
#[derive(Debug, Clone)]
pub struct SettingsRegistry {
    db: Arc<Database>,
}

impl SettingsRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Stored value for `key`, `Ok(None)` when unset
    pub fn try_get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE \"key\" = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Stored value for `key`, or the empty string when unset.
    ///
    /// Store failures also collapse to the empty string; they are logged.
    pub fn get_setting(&self, key: &str) -> String {
        match self.try_get_setting(key) {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => {
                warn!(key, error = %e, "failed to read setting");
                String::new()
            }
        }
    }

    /// Upsert a setting; last write wins
    pub fn save_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (\"key\", value) VALUES (?1, ?2)
                 ON CONFLICT(\"key\") DO UPDATE SET value = excluded.value",
                params![key, value],
            )
        })?;
        Ok(())
    }

    /// Seed every default whose key does not exist yet.
    ///
    /// Existing keys keep their value. Returns the number of rows inserted.
    pub fn init_defaults<I, K, V>(&self, defaults: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let inserted = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO settings (\"key\", value) VALUES (?1, ?2)
                     ON CONFLICT(\"key\") DO NOTHING",
                )?;
                for (key, value) in defaults {
                    inserted += stmt.execute(params![key.as_ref(), value.as_ref()])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })?;

        info!(inserted, "default settings seeded");
        Ok(inserted)
    }

    /// Integer setting, `fallback` when unset, unreadable or not a number
    pub fn get_int_setting(&self, key: &str, fallback: i64) -> i64 {
        self.get_setting(key).trim().parse().unwrap_or(fallback)
    }

    /// Boolean setting (`true`/`false`, any case), `fallback` otherwise
    pub fn get_bool_setting(&self, key: &str, fallback: bool) -> bool {
        match self.get_setting(key).trim().to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => fallback,
        }
    }

    /// Every stored setting
    pub fn all_settings(&self) -> Result<BTreeMap<String, String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT \"key\", value FROM settings")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }

    /// Theme and auto-start flag with their unset fallbacks applied
    pub fn client_config(&self) -> ClientConfig {
        let theme = self.get_setting("theme");
        ClientConfig {
            theme: if theme.is_empty() {
                DEFAULT_THEME.to_string()
            } else {
                theme
            },
            auto_start: self.get_setting("auto_start") == "true",
        }
    }
}
