//! In-process state store.
//!
//! Three maps behind mutexes, keyed by client id or token hash. Expiry is
//! enforced lazily: a `get` that finds an expired row removes it and reports
//! absence. Restarting the process forgets everything, including
//! dynamically-registered clients; that trade-off is documented for
//! operators.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::{Result, StateStore, StoreError, StoredAccessToken, StoredClient, StoredRefreshToken};

#[derive(Default)]
pub struct MemoryStore {
    clients: Mutex<HashMap<String, StoredClient>>,
    access_tokens: Mutex<HashMap<String, StoredAccessToken>>,
    refresh_tokens: Mutex<HashMap<String, StoredRefreshToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_client(&self, client_id: &str) -> Result<Option<StoredClient>> {
        Ok(self.clients.lock().get(client_id).cloned())
    }

    async fn save_client(&self, client: StoredClient) -> Result<()> {
        self.clients.lock().insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn delete_client(&self, client_id: &str) -> Result<()> {
        self.clients.lock().remove(client_id);
        Ok(())
    }

    async fn list_dynamic_clients(&self) -> Result<Vec<StoredClient>> {
        Ok(self
            .clients
            .lock()
            .values()
            .filter(|c| c.is_dynamic)
            .cloned()
            .collect())
    }

    async fn get_access_token(&self, token_hash: &str) -> Result<Option<StoredAccessToken>> {
        let mut tokens = self.access_tokens.lock();
        let expired = tokens
            .get(token_hash)
            .is_some_and(|t| t.expires_at <= Utc::now());
        if expired {
            tokens.remove(token_hash);
            return Ok(None);
        }
        Ok(tokens.get(token_hash).cloned())
    }

    async fn save_access_token(&self, token: StoredAccessToken) -> Result<()> {
        self.access_tokens
            .lock()
            .insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn delete_access_token(&self, token_hash: &str) -> Result<()> {
        self.access_tokens.lock().remove(token_hash);
        Ok(())
    }

    async fn get_refresh_token(&self, token_hash: &str) -> Result<Option<StoredRefreshToken>> {
        let mut tokens = self.refresh_tokens.lock();
        let expired = tokens
            .get(token_hash)
            .is_some_and(|t| t.expires_at <= Utc::now());
        if expired {
            tokens.remove(token_hash);
            return Ok(None);
        }
        Ok(tokens.get(token_hash).cloned())
    }

    async fn save_refresh_token(&self, token: StoredRefreshToken) -> Result<()> {
        self.refresh_tokens
            .lock()
            .insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn delete_refresh_token(&self, token_hash: &str) -> Result<()> {
        self.refresh_tokens.lock().remove(token_hash);
        Ok(())
    }

    async fn rotate_refresh_token(&self, old_hash: &str, new: StoredRefreshToken) -> Result<()> {
        let mut tokens = self.refresh_tokens.lock();
        let Some(old) = tokens.remove(old_hash) else {
            return Err(StoreError::Rotation("old token not found".to_string()));
        };
        if tokens.contains_key(&new.token_hash) {
            // Would clobber a live token; restore the old row and bail.
            tokens.insert(old_hash.to_string(), old);
            return Err(StoreError::Rotation("new token hash collides".to_string()));
        }
        tokens.insert(new.token_hash.clone(), new);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut removed = 0u64;
        {
            let mut tokens = self.access_tokens.lock();
            let before = tokens.len();
            tokens.retain(|_, t| t.expires_at > now);
            removed += (before - tokens.len()) as u64;
        }
        {
            let mut tokens = self.refresh_tokens.lock();
            let before = tokens.len();
            tokens.retain(|_, t| t.expires_at > now);
            removed += (before - tokens.len()) as u64;
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
