//! Saved API request definitions
//!
//! A request is identified by `(group_name, api_name, method, url)`. Saving the
//! same identity twice updates the existing row; `created_at` is written only
//! by the insert branch, and `updated_at` strictly increases on every save even
//! when two saves land in the same millisecond.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::database::Database;
use super::error::StoreError;
use super::now_millis;

const SELECT_COLUMNS: &str = "SELECT id, group_name, api_name, method, url, headers, params, \
     type, body, created_at, updated_at FROM api";

/// A stored request definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub id: i64,
    pub group_name: String,
    pub api_name: String,
    pub method: String,
    pub url: String,
    pub headers: String,
    pub params: String,
    #[serde(rename = "type")]
    pub body_type: String,
    pub body: String,
    /// Unix milliseconds, set once on insert
    pub created_at: i64,
    /// Unix milliseconds, strictly greater after every save
    pub updated_at: i64,
}

/// Request fields supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiRequestDraft {
    pub group_name: String,
    pub api_name: String,
    pub method: String,
    pub url: String,
    pub headers: String,
    pub params: String,
    #[serde(rename = "type")]
    pub body_type: String,
    pub body: String,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<ApiRequest> {
    Ok(ApiRequest {
        id: row.get(0)?,
        group_name: row.get(1)?,
        api_name: row.get(2)?,
        method: row.get(3)?,
        url: row.get(4)?,
        headers: row.get(5)?,
        params: row.get(6)?,
        body_type: row.get(7)?,
        body: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Request catalogue backed by the shared store
#[derive(Debug, Clone)]
pub struct RequestCatalog {
    db: Arc<Database>,
}

impl RequestCatalog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new request or update the one with the same identity
    pub fn upsert_api_request(&self, draft: &ApiRequestDraft) -> Result<ApiRequest, StoreError> {
        let now = now_millis();
        let stored = self.db.with_conn(|conn| {
            conn.query_row(
                "INSERT INTO api (group_name, api_name, method, url, headers, params, type, body,
                                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(group_name, api_name, method, url) DO UPDATE SET
                    headers = excluded.headers,
                    params = excluded.params,
                    type = excluded.type,
                    body = excluded.body,
                    updated_at = MAX(excluded.updated_at, api.updated_at + 1)
                 RETURNING id, group_name, api_name, method, url, headers, params, type, body,
                           created_at, updated_at",
                params![
                    draft.group_name,
                    draft.api_name,
                    draft.method,
                    draft.url,
                    draft.headers,
                    draft.params,
                    draft.body_type,
                    draft.body,
                    now,
                ],
                from_row,
            )
        })?;

        debug!(
            id = stored.id,
            group = %stored.group_name,
            name = %stored.api_name,
            "api request saved"
        );
        Ok(stored)
    }

    pub fn get_api_request(&self, id: i64) -> Result<Option<ApiRequest>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), [id], from_row)
                .optional()
        })
    }

    /// All requests ordered by group then name
    pub fn list_api_requests(&self) -> Result<Vec<ApiRequest>, StoreError> {
        self.query(
            &format!("{SELECT_COLUMNS} ORDER BY group_name, api_name, id"),
            [],
        )
    }

    pub fn list_by_group(&self, group_name: &str) -> Result<Vec<ApiRequest>, StoreError> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE group_name = ?1 ORDER BY api_name, id"),
            [group_name],
        )
    }

    /// Every method/url variant saved under `group_name` / `api_name`
    pub fn find_by_name(
        &self,
        group_name: &str,
        api_name: &str,
    ) -> Result<Vec<ApiRequest>, StoreError> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE group_name = ?1 AND api_name = ?2 ORDER BY id"),
            [group_name, api_name],
        )
    }

    /// Distinct group names, sorted
    pub fn list_groups(&self) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT group_name FROM api ORDER BY group_name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Remove a request; false when no such id exists
    pub fn delete_api_request(&self, id: i64) -> Result<bool, StoreError> {
        let deleted = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM api WHERE id = ?1", [id]))?;
        Ok(deleted > 0)
    }

    fn query<P: rusqlite::Params>(&self, sql: &str, args: P) -> Result<Vec<ApiRequest>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, from_row)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrate::migrate;
    use std::time::Duration;
    use tempfile::TempDir;

    fn catalog() -> (TempDir, RequestCatalog) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("requests.db")).unwrap());
        assert!(migrate(&db).is_clean());
        (dir, RequestCatalog::new(db))
    }

    fn draft(group: &str, name: &str, method: &str, url: &str, body: &str) -> ApiRequestDraft {
        ApiRequestDraft {
            group_name: group.to_string(),
            api_name: name.to_string(),
            method: method.to_string(),
            url: url.to_string(),
            headers: r#"{"Accept":"application/json"}"#.to_string(),
            params: String::new(),
            body_type: "json".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_same_identity_updates_in_place() {
        let (_dir, catalog) = catalog();

        let first = catalog
            .upsert_api_request(&draft("users", "create", "POST", "http://h/users", "{}"))
            .unwrap();
        let second = catalog
            .upsert_api_request(&draft(
                "users",
                "create",
                "POST",
                "http://h/users",
                r#"{"name":"a"}"#,
            ))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.body, r#"{"name":"a"}"#);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(catalog.list_api_requests().unwrap().len(), 1);
    }

    #[test]
    fn test_back_to_back_saves_advance_updated_at() {
        let (_dir, catalog) = catalog();
        let request = draft("auth", "login", "POST", "http://h/login", "");

        let mut previous = catalog.upsert_api_request(&request).unwrap();
        for _ in 0..50 {
            let next = catalog.upsert_api_request(&request).unwrap();
            assert_eq!(next.id, previous.id);
            assert_eq!(next.created_at, previous.created_at);
            assert!(next.updated_at > previous.updated_at);
            previous = next;
        }
    }

    #[test]
    fn test_store_written_by_older_version_is_readable() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("legacy.db")).unwrap());
        db.exec(
            "CREATE TABLE `api` (`id` integer PRIMARY KEY AUTOINCREMENT,`group_name` text,
                `api_name` text,`method` text,`url` text,`headers` text,`params` text,
                `type` text,`body` text,`created_at` datetime,`updated_at` datetime);
             CREATE UNIQUE INDEX `idx_uni` ON `api`(`group_name`,`api_name`,`method`,`url`);
             INSERT INTO api (group_name, api_name, method, url, headers, params, type, body,
                              created_at, updated_at)
             VALUES ('users', 'list', 'GET', 'http://h/users', '{}', '', 'none', '',
                     '2025-03-01 10:00:00.123+08:00', '2025-03-01 10:00:00.123+08:00');",
        )
        .unwrap();
        assert!(migrate(&db).is_clean());
        let catalog = RequestCatalog::new(db);

        let listed = catalog.list_api_requests().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].created_at, 1_740_794_400_123);

        let saved = catalog
            .upsert_api_request(&draft("users", "list", "GET", "http://h/users", "x"))
            .unwrap();
        assert_eq!(saved.id, listed[0].id);
        assert_eq!(saved.created_at, 1_740_794_400_123);
        assert!(saved.updated_at > listed[0].updated_at);
    }

    #[test]
    fn test_different_method_is_a_different_request() {
        let (_dir, catalog) = catalog();
        catalog
            .upsert_api_request(&draft("users", "item", "GET", "http://h/u/1", ""))
            .unwrap();
        catalog
            .upsert_api_request(&draft("users", "item", "DELETE", "http://h/u/1", ""))
            .unwrap();

        let variants = catalog.find_by_name("users", "item").unwrap();
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].method, "GET");
        assert_eq!(variants[1].method, "DELETE");
    }

    #[test]
    fn test_reads_do_not_touch_updated_at() {
        let (_dir, catalog) = catalog();
        let saved = catalog
            .upsert_api_request(&draft("g", "n", "GET", "http://h", ""))
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        catalog.list_api_requests().unwrap();
        catalog.list_by_group("g").unwrap();
        catalog.find_by_name("g", "n").unwrap();

        let fetched = catalog.get_api_request(saved.id).unwrap().unwrap();
        assert_eq!(fetched, saved);
    }

    #[test]
    fn test_groups_and_delete() {
        let (_dir, catalog) = catalog();
        let a = catalog
            .upsert_api_request(&draft("orders", "list", "GET", "http://h/o", ""))
            .unwrap();
        catalog
            .upsert_api_request(&draft("auth", "login", "POST", "http://h/login", ""))
            .unwrap();
        catalog
            .upsert_api_request(&draft("orders", "get", "GET", "http://h/o/1", ""))
            .unwrap();

        assert_eq!(catalog.list_groups().unwrap(), vec!["auth", "orders"]);
        let orders = catalog.list_by_group("orders").unwrap();
        assert_eq!(
            orders.iter().map(|r| r.api_name.as_str()).collect::<Vec<_>>(),
            vec!["get", "list"]
        );

        assert!(catalog.delete_api_request(a.id).unwrap());
        assert!(!catalog.delete_api_request(a.id).unwrap());
        assert!(catalog.get_api_request(a.id).unwrap().is_none());
        assert_eq!(catalog.list_by_group("orders").unwrap().len(), 1);
    }

    #[test]
    fn test_draft_json_shape() {
        let draft: ApiRequestDraft = serde_json::from_value(serde_json::json!({
            "groupName": "g",
            "apiName": "n",
            "method": "PUT",
            "url": "http://h",
            "type": "form"
        }))
        .unwrap();

        assert_eq!(draft.body_type, "form");
        assert_eq!(draft.body, "");
    }
}
