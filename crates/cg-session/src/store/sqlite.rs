//! Session persistence using SQLite

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::debug;

use cg_core::{Error, Result};

use super::KeyValueStore;

/// SQLite-backed key-value store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given database path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Store(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_tables()?;
        debug!("Opened session store at {}", db_path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_tables()?;
        Ok(store)
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize database tables
    fn init_tables(&self) -> Result<()> {
        self.connection().execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// List stored keys in name order
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let result = self.connection().query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.connection().execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.connection()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}
