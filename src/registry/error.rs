//! Registry errors

use crate::storage::StoreError;
use crate::tokens::{OwnershipKey, TransitionToken};
use std::time::Duration;
use thiserror::Error;

/// Errors from token table operations.
///
/// Lookups that find nothing return `None` rather than an error, and destroy
/// operations on unknown entries succeed as no-ops.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The owner must have an active session for this operation.
    #[error("owner '{0}' has no active session")]
    NoActiveSession(OwnershipKey),

    /// Transfer attempted by an owner without an active session.
    #[error("yielding owner '{0}' has no active session")]
    UnknownYielderSession(OwnershipKey),

    /// Transfer attempted on a token that is not in the yielder's carried set.
    #[error("token '{token}' is not carried by the session of '{owner}'")]
    TokenNotCarried {
        token: TransitionToken,
        owner: OwnershipKey,
    },

    /// Transfer or adoption towards an owner without an active session.
    #[error("receiving owner '{0}' has no active session")]
    UnknownReceiverSession(OwnershipKey),

    /// Adoption attempted on a token that still belongs to a session.
    #[error("token '{0}' is not orphaned")]
    TokenNotOrphaned(TransitionToken),

    /// The token already belongs to another session or is orphaned; it only
    /// moves through `transfer_token` or `adopt_token`.
    #[error("token '{0}' is held elsewhere")]
    TokenInUse(TransitionToken),

    /// Neither the cache nor the store holds a value for a token the tables
    /// still reference.
    #[error("token '{0}' has no stored value")]
    MissingValue(TransitionToken),

    /// The store reported an error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The store did not answer in time.
    #[error("store call '{op}' timed out after {after:?}")]
    StoreTimeout { op: &'static str, after: Duration },

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    /// Whether the operation was refused because the tables were not in the
    /// required state. Nothing was changed in that case.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RegistryError::NoActiveSession(_)
                | RegistryError::UnknownYielderSession(_)
                | RegistryError::TokenNotCarried { .. }
                | RegistryError::UnknownReceiverSession(_)
                | RegistryError::TokenNotOrphaned(_)
                | RegistryError::TokenInUse(_)
        )
    }

    /// Whether the failure came from the store (error or timeout)
    pub fn is_store_failure(&self) -> bool {
        matches!(self, RegistryError::Store(_) | RegistryError::StoreTimeout { .. })
    }
}
