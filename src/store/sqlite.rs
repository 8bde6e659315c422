use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{KvStore, StoreError};

const DEFAULT_STORE_PATH: &str = "var/naistrip/store.db";

/// SQLite-backed key-value store. Each value is one JSON document, so a
/// `set` is a single-row write.
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    db_path: PathBuf,
}

impl SqliteKvStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        self.with_connection(|_| Ok(()))
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(self.db_path.as_path())?;
        ensure_schema(&conn)?;
        func(&conn)
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_connection(|conn| {
            let raw = conn
                .query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            serde_json::from_str::<Value>(raw.as_str())
                .map(Some)
                .map_err(|error| StoreError::Decode {
                    key: key.to_string(),
                    message: error.to_string(),
                })
        })
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value).map_err(|error| StoreError::Encode {
            key: key.to_string(),
            message: error.to_string(),
        })?;
        self.with_connection(|conn| {
            conn.execute(
                "
                INSERT INTO kv_entries (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                  value = excluded.value,
                  updated_at = excluded.updated_at
                ",
                params![key, encoded, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_entries (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Resolves the store location from `NAISTRIP_DB`, relative paths landing
/// under `work_root`.
pub fn resolve_store_path(work_root: &Path) -> PathBuf {
    let configured = std::env::var("NAISTRIP_DB").ok();
    select_store_path(configured.as_deref(), work_root)
}

fn select_store_path(configured: Option<&str>, work_root: &Path) -> PathBuf {
    let raw = configured
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_STORE_PATH);
    let candidate = PathBuf::from(raw);
    if candidate.is_absolute() {
        candidate
    } else {
        work_root.join(candidate)
    }
}
