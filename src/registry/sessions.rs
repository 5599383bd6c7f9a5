//! Session lifecycle: add, verify, destroy, reload

use crate::registry::timing::{SessionTiming, SessionTimingRecord};
use crate::registry::{Membership, RegistryError, Tables, TokenTables};
use crate::tokens::{OwnershipKey, SessionToken, TransitionToken};
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl TokenTables {
    /// Register a session for an owner.
    ///
    /// If `transition_token` is given it becomes a bounded token of the
    /// session, valued with the ownership key. An owner holds one session at
    /// a time: a previous session of the same owner (or a previous use of the
    /// same session token) is destroyed first. A bounded token that is held
    /// by any other session, or orphaned, is refused with `TokenInUse`.
    pub async fn add_session(
        &self,
        session_token: &SessionToken,
        ownership_key: &OwnershipKey,
        transition_token: Option<&TransitionToken>,
    ) -> Result<(), RegistryError> {
        self.register_session(session_token, ownership_key, transition_token, false)
            .await
            .map(|_| ())
    }

    /// Like `add_session`, but the session's timing is also published to the
    /// store so that other processes can `reload_session` it. Returns the
    /// verification hash those processes need.
    pub async fn add_shared_session(
        &self,
        session_token: &SessionToken,
        ownership_key: &OwnershipKey,
        transition_token: Option<&TransitionToken>,
    ) -> Result<String, RegistryError> {
        self.register_session(session_token, ownership_key, transition_token, true)
            .await
    }

    /// Whether `ownership_key` owns the session.
    ///
    /// `None` if the session does not exist. Otherwise the answer comes from
    /// the store's verification of the stored hash.
    pub async fn active_session(
        &self,
        session_token: &SessionToken,
        ownership_key: &OwnershipKey,
    ) -> Result<Option<bool>, RegistryError> {
        let tables = self.tables.read().await;
        let Some(hash) = tables.session_hash(session_token) else {
            return Ok(None);
        };
        let verified = self
            .store_call("check_hash", self.store.check_hash(hash, ownership_key))
            .await?;
        Ok(Some(verified))
    }

    /// Remove a session and everything keyed by it.
    ///
    /// Bounded tokens are destroyed, carried tokens are orphaned. Unknown
    /// sessions are a no-op.
    pub async fn destroy_session(&self, session_token: &SessionToken) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;
        self.destroy_session_in(&mut tables, session_token)
            .await
            .map(|_| ())
    }

    /// Reinstate a shared session published by another process.
    ///
    /// Requires the timing record in the store and a hash that the store
    /// verifies against `ownership_key`. Returns false otherwise.
    pub async fn reload_session(
        &self,
        session_token: &SessionToken,
        ownership_key: &OwnershipKey,
        hash: &str,
    ) -> Result<bool, RegistryError> {
        let mut tables = self.tables.write().await;

        let Some(data) = self
            .store_call("get_key_value", self.store.get_key_value(session_token.as_str()))
            .await?
        else {
            return Ok(false);
        };
        let verified = self
            .store_call("check_hash", self.store.check_hash(hash, ownership_key))
            .await?;
        if !verified {
            debug!(session = %session_token, "Reload refused, hash does not verify");
            return Ok(false);
        }

        let record: SessionTimingRecord = serde_json::from_str(&data)?;
        let timing = SessionTiming::from_record(&record, Instant::now());

        if tables.owner_of(session_token) == Some(ownership_key) {
            tables.set_session_hash(session_token, hash.to_string());
            tables.set_session_timing(session_token, timing);
            return Ok(true);
        }

        self.clear_previous_sessions(&mut tables, session_token, ownership_key)
            .await?;
        tables.insert_session(session_token, ownership_key, hash.to_string(), timing);

        info!(session = %session_token, owner = %ownership_key, "Session reloaded");
        Ok(true)
    }

    pub async fn session_for_owner(&self, ownership_key: &OwnershipKey) -> Option<SessionToken> {
        self.tables.read().await.session_of(ownership_key).cloned()
    }

    pub async fn owner_of_session(&self, session_token: &SessionToken) -> Option<OwnershipKey> {
        self.tables.read().await.owner_of(session_token).cloned()
    }

    pub async fn bounded_tokens(&self, session_token: &SessionToken) -> Vec<TransitionToken> {
        self.tables.read().await.bounded_tokens(session_token)
    }

    /// Transferable tokens currently carried by the session
    pub async fn carried_tokens(&self, session_token: &SessionToken) -> Vec<TransitionToken> {
        self.tables.read().await.carried_tokens(session_token)
    }

    async fn register_session(
        &self,
        session_token: &SessionToken,
        ownership_key: &OwnershipKey,
        transition_token: Option<&TransitionToken>,
        shared: bool,
    ) -> Result<String, RegistryError> {
        let mut tables = self.tables.write().await;

        if let Some(token) = transition_token {
            let mut replaced = vec![session_token];
            if let Some(previous) = tables.session_of(ownership_key) {
                replaced.push(previous);
            }
            if tables.is_held_elsewhere(token, &replaced) {
                return Err(RegistryError::TokenInUse(token.clone()));
            }
        }

        self.clear_previous_sessions(&mut tables, session_token, ownership_key)
            .await?;

        let hash = self
            .store_call(
                "set_session_key_value",
                self.store.set_session_key_value(session_token, ownership_key),
            )
            .await?;

        if let Some(token) = transition_token {
            if let Err(e) = self
                .store_call("set_key_value", self.store.set_key_value(token.as_str(), ownership_key.as_str()))
                .await
            {
                self.rollback("del_session_key_value", self.store.del_session_key_value(session_token))
                    .await;
                return Err(e);
            }
        }

        let now = Instant::now();
        let timing = SessionTiming::new(tables.general_session_timeout, now, shared);

        if shared {
            let published = match serde_json::to_string(&timing.record(now)) {
                Ok(record) => {
                    self.store_call("set_key_value", self.store.set_key_value(session_token.as_str(), &record))
                        .await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = published {
                if let Some(token) = transition_token {
                    self.rollback("del_key_value", self.store.del_key_value(token.as_str()))
                        .await;
                }
                self.rollback("del_session_key_value", self.store.del_session_key_value(session_token))
                    .await;
                return Err(e);
            }
        }

        tables.insert_session(session_token, ownership_key, hash.clone(), timing);
        if let Some(token) = transition_token {
            tables.cache_value(token, ownership_key.to_string(), now);
            tables.attach_token(token, session_token, ownership_key, Membership::Bounded, now);
        }

        info!(session = %session_token, owner = %ownership_key, shared, "Session added");
        Ok(hash)
    }

    /// Destroy whatever session currently uses the token or belongs to the owner
    async fn clear_previous_sessions(
        &self,
        tables: &mut Tables,
        session_token: &SessionToken,
        ownership_key: &OwnershipKey,
    ) -> Result<(), RegistryError> {
        if let Some(previous) = tables.session_of(ownership_key).cloned() {
            info!(session = %previous, owner = %ownership_key, "Superseding previous session of owner");
            self.destroy_session_in(tables, &previous).await?;
        }
        if tables.has_session(session_token) {
            info!(session = %session_token, "Replacing session token binding");
            self.destroy_session_in(tables, session_token).await?;
        }
        Ok(())
    }

    /// Returns whether the session existed.
    ///
    /// Local indices are removed before any store record is deleted. Store
    /// deletions are all attempted; the first failure is returned.
    pub(crate) async fn destroy_session_in(
        &self,
        tables: &mut Tables,
        session_token: &SessionToken,
    ) -> Result<bool, RegistryError> {
        let Some(removed) = tables.remove_session(session_token, Instant::now()) else {
            return Ok(false);
        };

        let mut first_err = None;
        for token in &removed.bounded {
            if let Err(e) = self.delete_stored_value(tables, token).await {
                first_err.get_or_insert(e);
            }
        }
        if removed.shared {
            if let Err(e) = self
                .store_call("del_key_value", self.store.del_key_value(session_token.as_str()))
                .await
            {
                first_err.get_or_insert(e);
            }
        }
        match self
            .store_call("del_session_key_value", self.store.del_session_key_value(session_token))
            .await
        {
            Ok(existed) => {
                if !existed {
                    warn!(session = %session_token, "Store had no record for destroyed session");
                }
            }
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }

        info!(
            session = %session_token,
            owner = %removed.owner,
            bounded = removed.bounded.len(),
            orphaned = removed.orphaned.len(),
            "Session destroyed"
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }
}
