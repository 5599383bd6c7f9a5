//! Transition token payloads

use serde::Serialize;

/// Value carried by a transition token.
///
/// Registries always store the serialized form; `Structured` values are
/// rendered as compact JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    Raw(String),
    Structured(serde_json::Value),
}

impl TokenValue {
    /// Build a structured value from anything serde can serialize
    pub fn structured<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(TokenValue::Structured)
    }

    /// The string written to the store and the local cache
    pub fn into_stored(self) -> String {
        match self {
            TokenValue::Raw(s) => s,
            TokenValue::Structured(v) => v.to_string(),
        }
    }
}

impl From<&str> for TokenValue {
    fn from(s: &str) -> Self {
        TokenValue::Raw(s.to_string())
    }
}

impl From<String> for TokenValue {
    fn from(s: String) -> Self {
        TokenValue::Raw(s)
    }
}

impl From<serde_json::Value> for TokenValue {
    fn from(v: serde_json::Value) -> Self {
        TokenValue::Structured(v)
    }
}
