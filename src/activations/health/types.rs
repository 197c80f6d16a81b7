use serde::{Deserialize, Serialize};

/// Reply of `health:check`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HealthEvent {
    /// Current health status
    #[serde(rename = "status")]
    Status {
        status: String,
        /// Relay name from configuration
        relay: String,
        uptime_seconds: u64,
        timestamp: i64,
    },
}
