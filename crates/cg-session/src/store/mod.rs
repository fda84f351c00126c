//! Durable key-value storage for session fields
//!
//! The session manager only ever needs string get/set/remove, so any backend
//! that survives a restart can hold a session.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use cg_core::Result;

/// Synchronous string key-value store
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` when the key is absent
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value; removing an absent key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

/// Key names under which the session fields are persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub access_token: String,
    pub refresh_token: String,
    pub user: String,
}

impl StorageKeys {
    /// Keys with a prefix, so several apps can share one store
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            access_token: format!("{}token", prefix),
            refresh_token: format!("{}refreshToken", prefix),
            user: format!("{}user", prefix),
        }
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::with_prefix("")
    }
}
