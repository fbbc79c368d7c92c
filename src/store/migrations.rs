use rusqlite_migration::{Migrations, M};

/// Schema for the SQLite identity store.
/// Uses SQLite user_version pragma for tracking — no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: presence key space

CREATE TABLE presence_keys (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);",
    )])
}
