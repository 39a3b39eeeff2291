//! Server configuration: identity, timing knobs, and the path the
//! permission gate watches (spec.md §4.5, §9 "watch backpressure").
//!
//! Wire transport configuration (listen address, TLS, …) is out of scope
//! (spec.md §1): this is an in-process directory core, not a network
//! listener, so [`Config`] only carries knobs the core itself consults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Read(#[source] std::io::Error),
    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid server_user: {0}")]
    InvalidUser(String),
}

/// On-disk configuration, deserialized from TOML.
///
/// `watch_deadline_secs` and `gate_retry_backoff_secs` default to the
/// values spec.md suggests (10s, 1s) when the config file omits them.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The identity this directory server instance runs as. Its tree
    /// hosts `Group/Writers`, the policy file [`crate::gate::PermissionGate`]
    /// watches.
    pub server_user: String,

    /// Per-event delivery deadline before a subscriber is evicted as a
    /// slow consumer (spec.md §4.4, default 10s).
    #[serde(default = "default_watch_deadline_secs")]
    pub watch_deadline_secs: u64,

    /// Fixed backoff the permission gate sleeps between retries after a
    /// failed watch of its own `Writers` policy file (spec.md §4.5).
    #[serde(default = "default_gate_retry_backoff_secs")]
    pub gate_retry_backoff_secs: u64,
}

fn default_watch_deadline_secs() -> u64 {
    10
}

fn default_gate_retry_backoff_secs() -> u64 {
    1
}

impl Config {
    /// Load and validate a config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::parse(&text)
    }

    /// Parse configuration from an in-memory TOML document, as [`Config::load`]
    /// does after reading the file; split out so tests don't need a
    /// filesystem fixture.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        crate::path::validate_user(&config.server_user)
            .map_err(|_| ConfigError::InvalidUser(config.server_user.clone()))?;
        Ok(config)
    }

    pub fn watch_deadline(&self) -> Duration {
        Duration::from_secs(self.watch_deadline_secs)
    }

    pub fn gate_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.gate_retry_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::parse("server_user = \"dir@example.com\"\n").unwrap();
        assert_eq!(config.server_user, "dir@example.com");
        assert_eq!(config.watch_deadline(), Duration::from_secs(10));
        assert_eq!(config.gate_retry_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn parses_explicit_overrides() {
        let config = Config::parse(
            "server_user = \"dir@example.com\"\nwatch_deadline_secs = 30\ngate_retry_backoff_secs = 5\n",
        )
        .unwrap();
        assert_eq!(config.watch_deadline(), Duration::from_secs(30));
        assert_eq!(config.gate_retry_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_malformed_server_user() {
        let err = Config::parse("server_user = \"not-a-user\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUser(_)));
    }
}
