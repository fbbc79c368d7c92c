//! Identity store: the shared key-value space holding presence mappings.
//!
//! Backends only need atomic single-key get/set/del. `swap` and `del_if_eq`
//! have default implementations composed from those, and backends that can do
//! them atomically override them.

pub mod memory;
pub mod migrations;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod flaky;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryIdentityStore;
pub use sqlite::SqliteIdentityStore;

/// Errors reported by identity store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete `key`, returning whether it existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Write `value` and return whatever was stored before.
    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, StoreError> {
        let prior = self.get(key).await?;
        self.set(key, value).await?;
        Ok(prior)
    }

    /// Overwrite `key` with `value` only while it still holds `expected`.
    async fn set_if_eq(&self, key: &str, expected: &str, value: &str) -> Result<bool, StoreError> {
        match self.get(key).await? {
            Some(current) if current == expected => self.set(key, value).await.map(|_| true),
            _ => Ok(false),
        }
    }

    /// Delete `key` only while it still holds `expected`.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        match self.get(key).await? {
            Some(current) if current == expected => self.del(key).await,
            _ => Ok(false),
        }
    }
}

pub type SharedIdentityStore = Arc<dyn IdentityStore>;

/// Which backend holds the presence mappings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map. Only coordinates connections on this process.
    #[default]
    Memory,
    /// Shared SQLite file under the data directory.
    Sqlite,
}

/// Open the configured backend.
pub fn open_store(backend: StoreBackend, data_dir: &str) -> Result<SharedIdentityStore, StoreError> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryIdentityStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteIdentityStore::open(data_dir)?)),
    }
}
