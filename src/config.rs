//! Relay configuration
//!
//! Loaded from an optional TOML file, then overridden by `RELAY_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::relay::RelayError;

/// Default time a plugin gets to signal completion
pub const DEFAULT_PLUGIN_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Application name recorded on error hops
    pub name: String,

    /// Per-plugin boot timeout in milliseconds; `0` waits indefinitely
    pub plugin_timeout_ms: u64,

    /// Reply timeout for calls without `timeout$`; unset waits indefinitely
    pub request_timeout_ms: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            name: format!("relay-{}", host),
            plugin_timeout_ms: DEFAULT_PLUGIN_TIMEOUT_MS,
            request_timeout_ms: None,
        }
    }
}

impl RelayConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml(source: &str) -> Result<Self, RelayError> {
        toml::from_str(source).map_err(|e| RelayError::Validation(format!("invalid config: {}", e)))
    }

    /// Read a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Validation(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml(&source)
    }

    /// Apply `RELAY_NAME`, `RELAY_PLUGIN_TIMEOUT_MS` and `RELAY_REQUEST_TIMEOUT_MS`
    pub fn with_env(self) -> Result<Self, RelayError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RelayError> {
        if let Some(name) = lookup("RELAY_NAME") {
            self.name = name;
        }
        if let Some(ms) = lookup("RELAY_PLUGIN_TIMEOUT_MS") {
            self.plugin_timeout_ms = parse_ms("RELAY_PLUGIN_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("RELAY_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = Some(parse_ms("RELAY_REQUEST_TIMEOUT_MS", &ms)?);
        }
        Ok(self)
    }

    pub fn with_plugin_timeout(mut self, timeout: Duration) -> Self {
        self.plugin_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// `None` when plugin timeouts are disabled
    pub fn plugin_timeout(&self) -> Option<Duration> {
        (self.plugin_timeout_ms > 0).then(|| Duration::from_millis(self.plugin_timeout_ms))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_ms(key: &str, value: &str) -> Result<u64, RelayError> {
    value
        .trim()
        .parse()
        .map_err(|_| {
            RelayError::Validation(format!("{} must be milliseconds, got '{}'", key, value))
        })
}
