use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::BusinessError;

/// One recorded service-boundary crossing of an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    /// Topic of the registration that answered with the error
    pub service: String,
    /// Sorted `key:value` rendering of the inbound pattern
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    /// Correlation id of the call whose boundary was crossed
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Hop {
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        app: Option<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            app,
            request_id: request_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append `hop` to the error's trail
///
/// The same crossing (same request id) is only ever recorded once, so an error
/// re-sent on one call does not grow its trail. Returns whether a hop was added.
pub fn record(error: &mut BusinessError, hop: Hop) -> bool {
    if error
        .hops
        .last()
        .is_some_and(|last| last.request_id == hop.request_id)
    {
        return false;
    }
    error.hops.push(hop);
    true
}
