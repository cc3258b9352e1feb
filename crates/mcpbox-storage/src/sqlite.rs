//! SQLite-backed state store.
//!
//! One key/value table carries every entity; the entity type is the key
//! prefix (`client:`, `access:`, `refresh:`) and the value is the record
//! serialised as JSON. Clients have no `expires_at`; tokens always do.
//!
//! Refresh rotation runs delete + insert inside a single transaction so a
//! failed insert leaves the prior token intact.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{Result, StateStore, StoreError, StoredAccessToken, StoredClient, StoredRefreshToken};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at);
";

const CLIENT_PREFIX: &str = "client:";
const ACCESS_PREFIX: &str = "access:";
const REFRESH_PREFIX: &str = "refresh:";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!("sqlite state store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fetch a live row; an expired row is deleted and reported absent.
    fn get_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((_, Some(expires_at))) if expires_at <= Utc::now().timestamp() => {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
        }
    }

    fn put_value(&self, key: &str, value: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at.map(|t| t.timestamp())],
        )?;
        Ok(())
    }

    fn delete_value(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_client(&self, client_id: &str) -> Result<Option<StoredClient>> {
        match self.get_value(&format!("{CLIENT_PREFIX}{client_id}"))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_client(&self, client: StoredClient) -> Result<()> {
        let key = format!("{CLIENT_PREFIX}{}", client.client_id);
        self.put_value(&key, &serde_json::to_string(&client)?, None)
    }

    async fn delete_client(&self, client_id: &str) -> Result<()> {
        self.delete_value(&format!("{CLIENT_PREFIX}{client_id}"))
    }

    async fn list_dynamic_clients(&self) -> Result<Vec<StoredClient>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key LIKE 'client:%'")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut clients = Vec::new();
        for row in rows {
            let client: StoredClient = serde_json::from_str(&row?)?;
            if client.is_dynamic {
                clients.push(client);
            }
        }
        Ok(clients)
    }

    async fn get_access_token(&self, token_hash: &str) -> Result<Option<StoredAccessToken>> {
        match self.get_value(&format!("{ACCESS_PREFIX}{token_hash}"))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_access_token(&self, token: StoredAccessToken) -> Result<()> {
        let key = format!("{ACCESS_PREFIX}{}", token.token_hash);
        self.put_value(&key, &serde_json::to_string(&token)?, Some(token.expires_at))
    }

    async fn delete_access_token(&self, token_hash: &str) -> Result<()> {
        self.delete_value(&format!("{ACCESS_PREFIX}{token_hash}"))
    }

    async fn get_refresh_token(&self, token_hash: &str) -> Result<Option<StoredRefreshToken>> {
        match self.get_value(&format!("{REFRESH_PREFIX}{token_hash}"))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_refresh_token(&self, token: StoredRefreshToken) -> Result<()> {
        let key = format!("{REFRESH_PREFIX}{}", token.token_hash);
        self.put_value(&key, &serde_json::to_string(&token)?, Some(token.expires_at))
    }

    async fn delete_refresh_token(&self, token_hash: &str) -> Result<()> {
        self.delete_value(&format!("{REFRESH_PREFIX}{token_hash}"))
    }

    async fn rotate_refresh_token(&self, old_hash: &str, new: StoredRefreshToken) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let deleted = tx.execute(
            "DELETE FROM kv WHERE key = ?1",
            params![format!("{REFRESH_PREFIX}{old_hash}")],
        )?;
        if deleted == 0 {
            return Err(StoreError::Rotation("old token not found".to_string()));
        }

        // Plain INSERT: a hash collision aborts the transaction and the
        // dropped `tx` rolls back, leaving the old token live.
        tx.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![
                format!("{REFRESH_PREFIX}{}", new.token_hash),
                serde_json::to_string(&new)?,
                new.expires_at.timestamp()
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let removed = self.conn.lock().execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![Utc::now().timestamp()],
        )?;
        if removed > 0 {
            debug!(removed, "swept expired rows");
        }
        Ok(removed as u64)
    }

    async fn close(&self) -> Result<()> {
        // Force a WAL checkpoint so the main database file is current.
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .ok();
        Ok(())
    }
}
