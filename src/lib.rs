//! Token tables - in-memory ledger of sessions, owners, and capability tokens
//!
//! A `TokenTables` instance tracks which owner holds which session and which
//! transition tokens belong to each session. Bounded tokens live and die with
//! their session; carried tokens can be transferred between owners and are
//! orphaned rather than destroyed when their session ends. Everything that
//! must outlive the process is written through to a pluggable `Store`.

pub mod registry;
pub mod storage;
pub mod tokens;

pub use registry::{Membership, RegistryError, TablesConfig, TablesStats, TokenTables, TransferableInfo};
pub use storage::{MemoryStore, Store, StoreError};
pub use tokens::{OwnershipKey, SessionToken, Token, TokenFactory, TokenKind, TokenValue, TransitionToken};
