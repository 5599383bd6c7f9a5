//! In-memory store

use crate::storage::{async_trait, Store, StoreError};
use crate::tokens::{OwnershipKey, SessionToken};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;

/// Store that keeps everything in process memory.
///
/// Verification hashes have the form `<salt>.<mac>` where `mac` is
/// HMAC-SHA256(secret, salt || ownership key), both parts base64url encoded.
/// Only the holder of the secret can mint a hash, and `check_hash` compares
/// MACs in constant time.
pub struct MemoryStore {
    secret: Vec<u8>,
    sessions: DashMap<SessionToken, String>,
    values: DashMap<String, String>,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Create a store with a random 32 byte secret
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill(&mut secret);
        Self::with_secret(secret.to_vec())
    }

    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            sessions: DashMap::new(),
            values: DashMap::new(),
            offline: AtomicBool::new(false),
        }
    }

    /// Make every call fail with `StoreError::Unavailable` until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn contains_session(&self, session_token: &SessionToken) -> bool {
        self.sessions.contains_key(session_token)
    }

    pub fn contains_value(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn mac(&self, salt: &[u8], ownership_key: &OwnershipKey) -> Result<HmacSha256, StoreError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        mac.update(salt);
        mac.update(ownership_key.as_str().as_bytes());
        Ok(mac)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("secret", &"[REDACTED]")
            .field("sessions", &self.sessions.len())
            .field("values", &self.values.len())
            .finish()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set_session_key_value(
        &self,
        session_token: &SessionToken,
        ownership_key: &OwnershipKey,
    ) -> Result<String, StoreError> {
        self.ensure_online()?;

        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill(&mut salt);
        let tag = self.mac(&salt, ownership_key)?.finalize().into_bytes();
        let hash = format!("{}.{}", URL_SAFE_NO_PAD.encode(salt), URL_SAFE_NO_PAD.encode(tag));

        self.sessions.insert(session_token.clone(), hash.clone());
        debug!(session = %session_token, "Stored session record");
        Ok(hash)
    }

    async fn del_session_key_value(&self, session_token: &SessionToken) -> Result<bool, StoreError> {
        self.ensure_online()?;
        Ok(self.sessions.remove(session_token).is_some())
    }

    async fn set_key_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_online()?;
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_key_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_online()?;
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn del_key_value(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_online()?;
        self.values.remove(key);
        Ok(())
    }

    async fn check_hash(&self, hash: &str, ownership_key: &OwnershipKey) -> Result<bool, StoreError> {
        self.ensure_online()?;

        let Some((salt_b64, tag_b64)) = hash.split_once('.') else {
            return Ok(false);
        };
        let (Ok(salt), Ok(tag)) = (URL_SAFE_NO_PAD.decode(salt_b64), URL_SAFE_NO_PAD.decode(tag_b64)) else {
            return Ok(false);
        };

        Ok(self.mac(&salt, ownership_key)?.verify_slice(&tag).is_ok())
    }
}
