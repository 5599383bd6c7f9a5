//! Configuration for token tables

use crate::tokens::SESSION_PREFIX;
use std::time::Duration;

/// Default lifetime of a session that is not refreshed
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default interval between expiry sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Default bound on a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a `TokenTables` instance
#[derive(Debug, Clone)]
pub struct TablesConfig {
    /// Prefix that marks session tokens produced by the factory
    pub session_prefix: String,

    /// Upper bound on every store call; exceeding it fails the operation
    pub store_timeout: Duration,

    /// Time allotted to new sessions
    pub session_timeout: Duration,

    /// Time allotted to new transition tokens (`None` means no expiry)
    pub token_timeout: Option<Duration>,

    /// How often the background sweeper looks for expired entries
    pub sweep_interval: Duration,
}

impl TablesConfig {
    pub fn new() -> Self {
        Self {
            session_prefix: SESSION_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            token_timeout: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn session_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.session_prefix = prefix.into();
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn token_timeout(mut self, timeout: Duration) -> Self {
        self.token_timeout = Some(timeout);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TablesConfig::default();

        assert_eq!(config.session_prefix, "user+");
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.session_timeout, Duration::from_secs(3600));
        assert_eq!(config.token_timeout, None);
        assert_eq!(config.sweep_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_config_builder_chain() {
        let config = TablesConfig::new()
            .session_prefix("session-")
            .store_timeout(Duration::from_millis(250))
            .session_timeout(Duration::from_secs(600))
            .token_timeout(Duration::from_secs(200))
            .sweep_interval(Duration::from_secs(1));

        assert_eq!(config.session_prefix, "session-");
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.session_timeout, Duration::from_secs(600));
        assert_eq!(config.token_timeout, Some(Duration::from_secs(200)));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
    }
}
