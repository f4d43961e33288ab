use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

/// Namespace holding this device's own data.
pub const LOCAL_NAMESPACE: &str = "";

pub const INTAKES_KEY: &str = "caffeine_intakes";
pub const SETTINGS_KEY: &str = "caffeine_settings";
pub const SYNC_SESSION_KEY: &str = "sync_session";
/// Client ids removed from a remote ledger, kept so peers can drop their copies.
pub const REMOVED_KEY: &str = "removed_intakes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub client_id: String,
    pub deleted_at: i64,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv (
                    namespace TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (namespace, key)
                );

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS tombstones (
                    client_id TEXT PRIMARY KEY NOT NULL,
                    deleted_at INTEGER NOT NULL
                );

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Key-value store ---

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_in(LOCAL_NAMESPACE, key)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_in(LOCAL_NAMESPACE, key, value)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![LOCAL_NAMESPACE, key],
        )?;
        Ok(rows > 0)
    }

    pub fn get_in(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read key '{key}'"))?;
        Ok(value)
    }

    pub fn set_in(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, key) DO UPDATE SET value = ?3, updated_at = ?4",
                params![namespace, key, value, now],
            )
            .with_context(|| format!("Failed to write key '{key}'"))?;
        Ok(())
    }

    // --- Sync support ---

    pub fn record_tombstone(&self, client_id: &str, deleted_at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tombstones (client_id, deleted_at) VALUES (?1, ?2)
             ON CONFLICT(client_id) DO UPDATE SET deleted_at = ?2",
            params![client_id, deleted_at],
        )?;
        Ok(())
    }

    pub fn get_tombstones(&self) -> Result<Vec<Tombstone>> {
        let mut stmt = self
            .conn
            .prepare("SELECT client_id, deleted_at FROM tombstones ORDER BY deleted_at")?;
        let tombstones = stmt
            .query_map([], |row| {
                Ok(Tombstone {
                    client_id: row.get(0)?,
                    deleted_at: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tombstones)
    }

    pub fn clear_tombstone(&self, client_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM tombstones WHERE client_id = ?1",
            params![client_id],
        )?;
        Ok(())
    }
}
