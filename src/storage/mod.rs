//! Store backends for token tables
//!
//! The registry keeps all of its indices in memory and writes through to a
//! `Store` for anything that must outlive the process:
//! - session records: session token -> verification hash of the owner key
//! - key/values: transition token (or shared session) -> serialized value
//!
//! - Memory: DashMap tables with HMAC-SHA256 verification hashes

mod memory;

pub use memory::MemoryStore;

pub use async_trait::async_trait;
use thiserror::Error;

use crate::tokens::{OwnershipKey, SessionToken};

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Durable backend for sessions and token values
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist the session binding and return an opaque hash that later
    /// verifies the ownership key
    async fn set_session_key_value(
        &self,
        session_token: &SessionToken,
        ownership_key: &OwnershipKey,
    ) -> Result<String, StoreError>;

    /// Remove a session binding, returns whether it existed
    async fn del_session_key_value(&self, session_token: &SessionToken) -> Result<bool, StoreError>;

    /// Store a value under a token key
    async fn set_key_value(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Fetch the value stored under a token key
    async fn get_key_value(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete the value stored under a token key
    async fn del_key_value(&self, key: &str) -> Result<(), StoreError>;

    /// Verify an ownership key against a hash issued by `set_session_key_value`.
    ///
    /// Implementations must compare in constant time with respect to the key.
    async fn check_hash(&self, hash: &str, ownership_key: &OwnershipKey) -> Result<bool, StoreError>;
}
