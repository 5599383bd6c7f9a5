//! Session and token registry
//!
//! `TokenTables` owns every index (session <-> owner, token -> session,
//! token -> owner, per-session bounded/carried sets, value cache, timing) in
//! one `Tables` value behind an async `RwLock`:
//! - mutating operations hold the write lock for their whole duration,
//!   store calls included, so they are atomic with respect to each other
//! - lookups take the read lock and see a consistent snapshot
//!
//! Every store call is bounded by `TablesConfig::store_timeout`. Local edits
//! are applied only after the store calls they depend on have succeeded.

mod config;
mod error;
mod sessions;
mod tables;
mod timing;
mod transfer;
mod transitions;

pub use config::{TablesConfig, DEFAULT_SESSION_TIMEOUT, DEFAULT_STORE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
pub use error::RegistryError;
pub use tables::{Membership, TransferableInfo};
pub use timing::{SweepReport, SweeperHandle};

pub(crate) use tables::Tables;

use crate::storage::{Store, StoreError};
use crate::tokens::{SessionToken, Token, TokenFactory};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

/// Counts of what the tables currently hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TablesStats {
    pub sessions: usize,
    pub cached_values: usize,
    pub orphaned_tokens: usize,
    pub detached_sessions: usize,
    /// Tokens destroyed locally whose store record still has to be deleted
    pub pending_deletes: usize,
}

/// In-memory ledger of sessions, owners, and transition tokens
pub struct TokenTables {
    store: Arc<dyn Store>,
    factory: RwLock<TokenFactory>,
    config: TablesConfig,
    tables: tokio::sync::RwLock<Tables>,
}

impl TokenTables {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, TablesConfig::default())
    }

    pub fn with_config(store: Arc<dyn Store>, config: TablesConfig) -> Self {
        let factory = TokenFactory::new().session_prefix(config.session_prefix.clone());
        let tables = Tables::new(config.session_timeout, config.token_timeout);
        Self {
            store,
            factory: RwLock::new(factory),
            config,
            tables: tokio::sync::RwLock::new(tables),
        }
    }

    /// Replace the token factory (e.g. with a deterministic generator)
    pub fn with_token_factory(self, factory: TokenFactory) -> Self {
        *self.factory.write() = factory;
        self
    }

    /// Swap the generator after construction, keeping the session prefix
    pub fn set_token_creator<F>(&self, generator: F)
    where
        F: Fn(Option<&str>) -> String + Send + Sync + 'static,
    {
        let mut factory = self.factory.write();
        let prefix = factory.prefix().to_string();
        *factory = TokenFactory::with_generator(generator).session_prefix(prefix);
    }

    pub fn config(&self) -> &TablesConfig {
        &self.config
    }

    pub fn create_token(&self, prefix: Option<&str>) -> Token {
        self.factory.read().create_token(prefix)
    }

    pub fn create_session_token(&self) -> SessionToken {
        self.factory.read().create_session_token()
    }

    pub async fn stats(&self) -> TablesStats {
        let tables = self.tables.read().await;
        TablesStats {
            sessions: tables.session_count(),
            cached_values: tables.cached_count(),
            orphaned_tokens: tables.orphaned_tokens().len(),
            detached_sessions: tables.detached_sessions().len(),
            pending_deletes: tables.pending_deletes().len(),
        }
    }

    /// Run one store call under the configured timeout
    pub(crate) async fn store_call<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, RegistryError> {
        match timeout(self.config.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "Store call failed");
                Err(RegistryError::Store(e))
            }
            Err(_) => {
                warn!(op, timeout = ?self.config.store_timeout, "Store call timed out");
                Err(RegistryError::StoreTimeout {
                    op,
                    after: self.config.store_timeout,
                })
            }
        }
    }

    /// Undo a store write after a later step failed. Failures are logged only.
    pub(crate) async fn rollback<T>(&self, op: &'static str, call: impl Future<Output = Result<T, StoreError>>) {
        if let Err(e) = self.store_call(op, call).await {
            warn!(op, error = %e, "Rollback of store write failed");
        }
    }
}
