//! Moving carried tokens between owners
//!
//! A carried token belongs to its owner's session until the owner yields it
//! to another owner with an active session. When a session ends its carried
//! tokens are orphaned and can be adopted by any owner with a session.
//! Carried tokens may be marked sellable at a price; the registry only keeps
//! that bookkeeping, it does not settle anything.

use crate::registry::{Membership, RegistryError, Tables, TokenTables, TransferableInfo};
use crate::tokens::{OwnershipKey, SessionToken, TokenValue, TransitionToken};
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, info};

impl TokenTables {
    /// Create a carried token in the owner's session.
    ///
    /// Fails with `NoActiveSession` if the owner has no session and with
    /// `TokenInUse` if the token is orphaned or held by another session.
    pub async fn add_transferable_token(
        &self,
        token: &TransitionToken,
        value: impl Into<TokenValue>,
        ownership_key: &OwnershipKey,
    ) -> Result<(), RegistryError> {
        self.add_session_token(token, value.into(), ownership_key, Membership::Carried)
            .await
    }

    /// Create a bounded token in the owner's session; it is destroyed with
    /// the session and cannot be transferred.
    pub async fn add_session_bounded_token(
        &self,
        token: &TransitionToken,
        value: impl Into<TokenValue>,
        ownership_key: &OwnershipKey,
    ) -> Result<(), RegistryError> {
        self.add_session_token(token, value.into(), ownership_key, Membership::Bounded)
            .await
    }

    /// Move a carried token from the yielder's session to the receiver's.
    ///
    /// All preconditions are checked before anything changes. The token's
    /// registration is destroyed and recreated under the receiver with the
    /// same value; sellable state does not carry over.
    pub async fn transfer_token(
        &self,
        token: &TransitionToken,
        yielder_key: &OwnershipKey,
        receiver_key: &OwnershipKey,
    ) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;

        let yielder_session = tables
            .session_of(yielder_key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownYielderSession(yielder_key.clone()))?;
        if !tables.is_carried_by(&yielder_session, token) {
            return Err(RegistryError::TokenNotCarried {
                token: token.clone(),
                owner: yielder_key.clone(),
            });
        }
        let receiver_session = tables
            .session_of(receiver_key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownReceiverSession(receiver_key.clone()))?;

        self.relocate_carried(&mut tables, token, &receiver_session, receiver_key)
            .await?;

        info!(token = %token, from = %yielder_key, to = %receiver_key, "Token transferred");
        Ok(())
    }

    /// Give an orphaned token to an owner with an active session
    pub async fn adopt_token(
        &self,
        token: &TransitionToken,
        receiver_key: &OwnershipKey,
    ) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;

        if !tables.is_orphaned(token) {
            return Err(RegistryError::TokenNotOrphaned(token.clone()));
        }
        let receiver_session = tables
            .session_of(receiver_key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownReceiverSession(receiver_key.clone()))?;

        self.relocate_carried(&mut tables, token, &receiver_session, receiver_key)
            .await?;

        info!(token = %token, to = %receiver_key, "Orphaned token adopted");
        Ok(())
    }

    /// Attach a token that another process granted (it exists in the store
    /// but not in these tables) to the owner's session as a carried token.
    ///
    /// Returns false if the store has no value for it, or it already belongs
    /// to a session here or is orphaned (see `adopt_token`).
    pub async fn acquire_token(
        &self,
        token: &TransitionToken,
        ownership_key: &OwnershipKey,
    ) -> Result<bool, RegistryError> {
        let mut tables = self.tables.write().await;

        let session_token = tables
            .session_of(ownership_key)
            .cloned()
            .ok_or_else(|| RegistryError::NoActiveSession(ownership_key.clone()))?;
        if tables.is_held_elsewhere(token, &[]) {
            return Ok(false);
        }
        let Some(value) = self.load_value(&tables, token).await? else {
            return Ok(false);
        };

        let now = Instant::now();
        tables.fill_value(token, value, now);
        tables.attach_token(token, &session_token, ownership_key, Membership::Carried, now);

        debug!(token = %token, owner = %ownership_key, "Token acquired");
        Ok(true)
    }

    pub async fn token_is_transferable(&self, token: &TransitionToken) -> bool {
        self.tables.read().await.transferable(token).is_some()
    }

    pub async fn transferable_info(&self, token: &TransitionToken) -> Option<TransferableInfo> {
        self.tables.read().await.transferable(token).cloned()
    }

    /// Mark a transferable token as for sale, optionally at a new price
    pub async fn set_token_sellable(&self, token: &TransitionToken, price: Option<f64>) -> bool {
        let mut tables = self.tables.write().await;
        match tables.transferable_mut(token) {
            Some(info) => {
                if let Some(price) = price {
                    info.price = price;
                }
                info.sellable = true;
                true
            }
            None => false,
        }
    }

    pub async fn unset_token_sellable(&self, token: &TransitionToken) -> bool {
        let mut tables = self.tables.write().await;
        match tables.transferable_mut(token) {
            Some(info) => {
                info.sellable = false;
                true
            }
            None => false,
        }
    }

    pub async fn list_sellable_tokens(&self) -> Vec<TransitionToken> {
        let tables = self.tables.read().await;
        let mut tokens: Vec<TransitionToken> = tables.sellable().map(|(t, _)| t.clone()).collect();
        tokens.sort();
        tokens
    }

    /// Sellable tokens with their prices
    pub async fn map_sellable_tokens(&self) -> HashMap<TransitionToken, f64> {
        let tables = self.tables.read().await;
        tables
            .sellable()
            .map(|(t, info)| (t.clone(), info.price))
            .collect()
    }

    /// Orphaned tokens waiting to be adopted
    pub async fn list_unassigned_tokens(&self) -> Vec<TransitionToken> {
        self.tables.read().await.orphaned_tokens()
    }

    async fn add_session_token(
        &self,
        token: &TransitionToken,
        value: TokenValue,
        ownership_key: &OwnershipKey,
        membership: Membership,
    ) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;

        let session_token = tables
            .session_of(ownership_key)
            .cloned()
            .ok_or_else(|| RegistryError::NoActiveSession(ownership_key.clone()))?;
        if tables.is_held_elsewhere(token, &[&session_token]) {
            return Err(RegistryError::TokenInUse(token.clone()));
        }

        self.put_token_value(&mut tables, token, value.into_stored())
            .await?;
        tables.attach_token(token, &session_token, ownership_key, membership, Instant::now());

        debug!(token = %token, owner = %ownership_key, ?membership, "Token added to session");
        Ok(())
    }

    /// Destroy the token's registration and recreate it as a carried token of
    /// `session_token`, keeping its value.
    ///
    /// The store record is rewritten in place before the local tables change,
    /// so a store failure leaves the previous registration intact.
    async fn relocate_carried(
        &self,
        tables: &mut Tables,
        token: &TransitionToken,
        session_token: &SessionToken,
        owner: &OwnershipKey,
    ) -> Result<(), RegistryError> {
        let value = self
            .load_value(tables, token)
            .await?
            .ok_or_else(|| RegistryError::MissingValue(token.clone()))?;

        self.store_call("set_key_value", self.store.set_key_value(token.as_str(), &value))
            .await?;

        let now = Instant::now();
        tables.forget_token(token);
        tables.cache_value(token, value, now);
        tables.attach_token(token, session_token, owner, Membership::Carried, now);
        Ok(())
    }
}
