use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::migrations;
use super::{IdentityStore, StoreError};

/// How long a writer waits on another process's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity store backed by a SQLite file.
///
/// Several server processes on one host can point at the same file and see a
/// single key space. rusqlite is synchronous, so every call runs under
/// `spawn_blocking` with the connection behind an `Arc<Mutex>`.
#[derive(Clone)]
pub struct SqliteIdentityStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteIdentityStore {
    /// Open (or create) `presence.db` under `data_dir`, enable WAL mode, and
    /// run migrations.
    pub fn open(data_dir: &str) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Backend(e.to_string()))?;

        let db_path = Path::new(data_dir).join("presence.db");
        let mut conn = Connection::open(&db_path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        migrations::migrations()
            .to_latest(&mut conn)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        tracing::info!("Identity store opened at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut conn).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn upsert(conn: &Connection, key: &str, value: &str) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "INSERT INTO presence_keys (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![key, value, Utc::now().to_rfc3339()],
    )
}

fn select(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM presence_keys WHERE key = ?1",
        [key],
        |row| row.get::<_, String>(0),
    )
    .optional()
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| select(conn, &key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.run(move |conn| upsert(conn, &key, &value).map(|_| ()))
            .await
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM presence_keys WHERE key = ?1", [&key])
                .map(|n| n > 0)
        })
        .await
    }

    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.run(move |conn| {
            // IMMEDIATE takes the write lock up front so no other process can
            // slip a write between the read and the upsert.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let prior = select(&tx, &key)?;
            upsert(&tx, &key, &value)?;
            tx.commit()?;
            Ok(prior)
        })
        .await
    }

    async fn set_if_eq(&self, key: &str, expected: &str, value: &str) -> Result<bool, StoreError> {
        let (key, expected, value) = (key.to_string(), expected.to_string(), value.to_string());
        self.run(move |conn| {
            conn.execute(
                "UPDATE presence_keys SET value = ?3, updated_at = ?4 WHERE key = ?1 AND value = ?2",
                rusqlite::params![key, expected, value, Utc::now().to_rfc3339()],
            )
            .map(|n| n > 0)
        })
        .await
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let (key, expected) = (key.to_string(), expected.to_string());
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM presence_keys WHERE key = ?1 AND value = ?2",
                [&key, &expected],
            )
            .map(|n| n > 0)
        })
        .await
    }
}
