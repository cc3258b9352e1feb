//! Persistence for the gateway's OAuth state.
//!
//! Clients and tokens outlive a request; everything else the OAuth server
//! tracks (authorization codes, pending login sessions) is process-local and
//! lives outside this crate. Two backends implement the same [`StateStore`]
//! trait: an in-process map store and a SQLite key/value store with TTLs.
//!
//! Tokens are only ever reachable by their SHA-256 hash. The plaintext is
//! handed to the client once and never enters this crate.

mod memory;
mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// How often the background sweeper deletes expired rows.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Errors surfaced by a state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("refresh token rotation failed: {0}")]
    Rotation(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A registered OAuth client, pre-configured or dynamically registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredClient {
    pub client_id: String,
    /// SHA-256 hex digest of the client secret, when the client has one.
    pub client_secret_hash: Option<String>,
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub created_at: DateTime<Utc>,
    pub is_dynamic: bool,
}

/// An issued access token, stored by hash only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccessToken {
    pub token_hash: String,
    pub client_id: String,
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
}

/// An issued refresh token, stored by hash only. Rotated on every use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRefreshToken {
    pub token_hash: String,
    pub client_id: String,
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
}

/// Uniform persistence interface for both backends.
///
/// `get_*` return `None` for rows that are absent *or expired*; an expired
/// row is removed on the way out. `rotate_refresh_token` is atomic: either
/// the old hash is gone and the new one is live, or the store is unchanged.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_client(&self, client_id: &str) -> Result<Option<StoredClient>>;
    async fn save_client(&self, client: StoredClient) -> Result<()>;
    async fn delete_client(&self, client_id: &str) -> Result<()>;
    async fn list_dynamic_clients(&self) -> Result<Vec<StoredClient>>;

    async fn get_access_token(&self, token_hash: &str) -> Result<Option<StoredAccessToken>>;
    async fn save_access_token(&self, token: StoredAccessToken) -> Result<()>;
    async fn delete_access_token(&self, token_hash: &str) -> Result<()>;

    async fn get_refresh_token(&self, token_hash: &str) -> Result<Option<StoredRefreshToken>>;
    async fn save_refresh_token(&self, token: StoredRefreshToken) -> Result<()>;
    async fn delete_refresh_token(&self, token_hash: &str) -> Result<()>;

    /// Invalidate `old_hash` and insert `new` as one atomic step.
    async fn rotate_refresh_token(&self, old_hash: &str, new: StoredRefreshToken) -> Result<()>;

    /// Remove expired rows; returns how many were deleted.
    async fn cleanup_expired(&self) -> Result<u64>;

    /// Flush and release underlying resources.
    async fn close(&self) -> Result<()>;
}
