//! Token identifiers and payload values
//!
//! Token prefixes:
//! - `user+` : session token (reserved prefix, configurable)
//! - anything else, or no prefix : transition token
//!
//! The prefix only classifies a token at creation time. After that the kind
//! travels with the type (`SessionToken` vs `TransitionToken`) and is never
//! re-derived from the string.

mod factory;
mod ids;
mod value;

pub use factory::{random_token, Token, TokenFactory, TokenGenerator, TokenKind, SESSION_PREFIX};
pub use ids::{OwnershipKey, SessionToken, TransitionToken};
pub use value::TokenValue;
