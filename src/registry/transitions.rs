//! Transition token lifecycle: values, cache, destruction, ownership lookup

use crate::registry::{RegistryError, Tables, TokenTables};
use crate::tokens::{OwnershipKey, TokenValue, TransitionToken};
use tokio::time::Instant;
use tracing::debug;

impl TokenTables {
    /// Store a token's value (write-through) and cache it locally.
    ///
    /// Ownership and session membership are left to the calling operation.
    pub async fn add_token(
        &self,
        token: &TransitionToken,
        value: impl Into<TokenValue>,
    ) -> Result<(), RegistryError> {
        let stored = value.into().into_stored();
        let mut tables = self.tables.write().await;
        self.put_token_value(&mut tables, token, stored).await
    }

    /// The token's value if it is active, reading through to the store on a
    /// cache miss. `None` means the token is unknown or inactive.
    pub async fn transition_token_is_active(
        &self,
        token: &TransitionToken,
    ) -> Result<Option<String>, RegistryError> {
        {
            let tables = self.tables.read().await;
            if let Some(value) = tables.cached_value(token) {
                return Ok(Some(value.clone()));
            }
            if tables.is_pending_delete(token) {
                return Ok(None);
            }
        }

        let mut tables = self.tables.write().await;
        if let Some(value) = tables.cached_value(token) {
            return Ok(Some(value.clone()));
        }
        if tables.is_pending_delete(token) {
            return Ok(None);
        }

        let fetched = self
            .store_call("get_key_value", self.store.get_key_value(token.as_str()))
            .await?;
        if let Some(value) = &fetched {
            tables.fill_value(token, value.clone(), Instant::now());
            debug!(token = %token, "Token value filled from store");
        }
        Ok(fetched)
    }

    /// Remove a token from every table and from the store.
    ///
    /// Unknown tokens, including ones already destroyed, are a no-op. If the
    /// store delete fails the token stays inactive locally and the delete is
    /// retried by the next `destroy_token` or `sweep_expired`.
    pub async fn destroy_token(&self, token: &TransitionToken) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;
        self.destroy_token_in(&mut tables, token).await.map(|_| ())
    }

    /// Owner the token currently belongs to
    pub async fn from_token(&self, token: &TransitionToken) -> Option<OwnershipKey> {
        self.tables.read().await.owner_of_token(token).cloned()
    }

    /// Drop every cached value. The next read of each token goes to the store.
    pub async fn evict_cached_values(&self) -> usize {
        let evicted = self.tables.write().await.evict_values();
        debug!(evicted, "Token value cache evicted");
        evicted
    }

    pub async fn evict_cached_value(&self, token: &TransitionToken) -> bool {
        self.tables.write().await.evict_value(token)
    }

    pub(crate) async fn put_token_value(
        &self,
        tables: &mut Tables,
        token: &TransitionToken,
        stored: String,
    ) -> Result<(), RegistryError> {
        self.store_call("set_key_value", self.store.set_key_value(token.as_str(), &stored))
            .await?;
        tables.cache_value(token, stored, Instant::now());
        debug!(token = %token, "Token value stored");
        Ok(())
    }

    /// Current value of a token from the cache, else the store
    pub(crate) async fn load_value(
        &self,
        tables: &Tables,
        token: &TransitionToken,
    ) -> Result<Option<String>, RegistryError> {
        if let Some(value) = tables.cached_value(token) {
            return Ok(Some(value.clone()));
        }
        if tables.is_pending_delete(token) {
            return Ok(None);
        }
        self.store_call("get_key_value", self.store.get_key_value(token.as_str()))
            .await
    }

    /// Returns whether the token was known locally
    pub(crate) async fn destroy_token_in(
        &self,
        tables: &mut Tables,
        token: &TransitionToken,
    ) -> Result<bool, RegistryError> {
        let known = tables.forget_token(token);
        if !known && !tables.is_pending_delete(token) {
            return Ok(false);
        }
        self.delete_stored_value(tables, token).await?;
        debug!(token = %token, "Token destroyed");
        Ok(known)
    }

    /// Delete a forgotten token's store record. On failure the token is kept
    /// as a pending delete so that it cannot be read back from the store.
    pub(crate) async fn delete_stored_value(
        &self,
        tables: &mut Tables,
        token: &TransitionToken,
    ) -> Result<(), RegistryError> {
        match self
            .store_call("del_key_value", self.store.del_key_value(token.as_str()))
            .await
        {
            Ok(()) => {
                tables.clear_pending_delete(token);
                Ok(())
            }
            Err(e) => {
                tables.mark_pending_delete(token);
                Err(e)
            }
        }
    }
}
