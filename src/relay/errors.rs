//! Error types for relay operations
//!
//! [`BusinessError`] is the value that travels across the wire: anything a
//! handler or hook fails with ends up as one, carrying its hop trail.
//! [`RelayError`] is what the local API returns.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use super::hops::Hop;
use crate::plugin_system::types::PluginMeta;
use crate::transport::TransportError;

/// Error raised by a handler or hook, serializable across service boundaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessError {
    /// Error identity, e.g. `Error`, `Unauthorized`
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Service boundaries this error crossed, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hops: Vec<Hop>,
}

impl BusinessError {
    /// A plain error named `Error`
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            details: None,
            hops: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// No registration accepted the pattern
    pub fn pattern_not_found(method: &str) -> Self {
        Self::named("PatternNotFound", format!("No handler found for {}", method))
            .with_code("ERR_PATTERN_NOT_FOUND")
    }
}

impl fmt::Display for BusinessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for BusinessError {}

/// Error type for relay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Pattern or payload failed a shape check
    #[error("Validation error: {0}")]
    Validation(String),

    /// Error returned by a handler or hook, local or remote
    #[error(transparent)]
    Business(BusinessError),

    /// A plugin did not signal completion in time
    #[error("Plugin '{}' did not complete within {:?}", .plugin.name, .timeout)]
    PluginTimeout { plugin: PluginMeta, timeout: Duration },

    /// A plugin signalled completion with an error
    #[error("Plugin '{}' failed: {}", .plugin.name, .source)]
    PluginFailed {
        plugin: PluginMeta,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Payload bytes could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// No reply arrived within the configured `timeout$`
    #[error("No reply for {method} within {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    /// The relay has been closed
    #[error("Relay is closed")]
    Closed,
}

impl RelayError {
    /// Stable machine-readable code
    pub fn code(&self) -> &str {
        match self {
            RelayError::Validation(_) => "ERR_VALIDATION",
            RelayError::Business(err) => err.code.as_deref().unwrap_or("ERR_BUSINESS"),
            RelayError::PluginTimeout { .. } => "ERR_PLUGIN_TIMEOUT",
            RelayError::PluginFailed { .. } => "ERR_PLUGIN_FAILED",
            RelayError::Transport(_) => "ERR_TRANSPORT",
            RelayError::Decode(_) => "ERR_DECODE",
            RelayError::RequestTimeout { .. } => "ERR_REQUEST_TIMEOUT",
            RelayError::Closed => "ERR_CLOSED",
        }
    }

    /// The remote error, if this is one
    pub fn as_business(&self) -> Option<&BusinessError> {
        match self {
            RelayError::Business(err) => Some(err),
            _ => None,
        }
    }

    /// Descriptor of the plugin a boot error concerns
    pub fn plugin(&self) -> Option<&PluginMeta> {
        match self {
            RelayError::PluginTimeout { plugin, .. } | RelayError::PluginFailed { plugin, .. } => {
                Some(plugin)
            }
            _ => None,
        }
    }
}

impl From<BusinessError> for RelayError {
    fn from(err: BusinessError) -> Self {
        RelayError::Business(err)
    }
}

/// Lets handlers propagate nested call failures with `?`
impl From<RelayError> for BusinessError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Business(inner) => inner,
            RelayError::Validation(message) => {
                BusinessError::named("ValidationError", message).with_code("ERR_VALIDATION")
            }
            other => {
                let code = other.code().to_string();
                BusinessError::named("RelayError", other.to_string()).with_code(code)
            }
        }
    }
}
