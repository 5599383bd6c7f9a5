//! Token generation and classification

use crate::tokens::{SessionToken, TransitionToken};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use uuid::Builder;

/// Reserved prefix marking a session token
pub const SESSION_PREFIX: &str = "user+";

/// Produces the full token string for an optional prefix.
pub type TokenGenerator = Arc<dyn Fn(Option<&str>) -> String + Send + Sync>;

/// What a freshly created token is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Session,
    Transition,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Session => write!(f, "session"),
            TokenKind::Transition => write!(f, "transition"),
        }
    }
}

/// A token string tagged with its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    id: String,
    kind: TokenKind,
}

impl Token {
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn is_session(&self) -> bool {
        self.kind == TokenKind::Session
    }

    /// Take the token as a session token, if that is what it was created as
    pub fn into_session(self) -> Option<SessionToken> {
        match self.kind {
            TokenKind::Session => Some(SessionToken::new(self.id)),
            TokenKind::Transition => None,
        }
    }

    /// Take the token as a transition token, if that is what it was created as
    pub fn into_transition(self) -> Option<TransitionToken> {
        match self.kind {
            TokenKind::Transition => Some(TransitionToken::new(self.id)),
            TokenKind::Session => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Default generator: prefix followed by a version-4 UUID.
///
/// The 16 random bytes come from the thread-local CSPRNG, which is seeded
/// from the OS once per thread and never re-seeded per call.
pub fn random_token(prefix: Option<&str>) -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    let id = Builder::from_random_bytes(bytes).into_uuid();
    format!("{}{}", prefix.unwrap_or(""), id)
}

/// Creates tokens and classifies them by prefix
#[derive(Clone)]
pub struct TokenFactory {
    session_prefix: String,
    generator: TokenGenerator,
}

impl TokenFactory {
    pub fn new() -> Self {
        Self {
            session_prefix: SESSION_PREFIX.to_string(),
            generator: Arc::new(random_token),
        }
    }

    /// Use an application supplied generator (deterministic ids in tests, etc.)
    pub fn with_generator<F>(generator: F) -> Self
    where
        F: Fn(Option<&str>) -> String + Send + Sync + 'static,
    {
        Self {
            session_prefix: SESSION_PREFIX.to_string(),
            generator: Arc::new(generator),
        }
    }

    /// Override the reserved session prefix
    pub fn session_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.session_prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.session_prefix
    }

    pub fn create_token(&self, prefix: Option<&str>) -> Token {
        let id = (self.generator)(prefix);
        let kind = match prefix {
            Some(p) if p == self.session_prefix => TokenKind::Session,
            _ => TokenKind::Transition,
        };
        Token { id, kind }
    }

    pub fn create_session_token(&self) -> SessionToken {
        SessionToken::new((self.generator)(Some(&self.session_prefix)))
    }
}

impl Default for TokenFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenFactory")
            .field("session_prefix", &self.session_prefix)
            .finish_non_exhaustive()
    }
}
