//! Pattern → transport subject and delivery mode
//!
//! The subject is the pattern's topic. Registrations subscribe inside a queue
//! group (`queue.<topic>` unless `queue$` names another), so instances sharing
//! a group compete for each call while every distinct group receives its own
//! copy. `pubsub$` registrations subscribe without a group and see every
//! broadcast.

use std::fmt;

use super::errors::RelayError;
use crate::types::Pattern;

/// Prefix of the implicit queue group
pub const DEFAULT_QUEUE_PREFIX: &str = "queue.";

/// Whether a call waits for replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Request/reply through an inbox
    RequestReply,
    /// Fire-and-forget publish
    Publish,
}

impl DeliveryMode {
    pub fn of(pattern: &Pattern) -> Self {
        if pattern.is_pubsub() {
            DeliveryMode::Publish
        } else {
            DeliveryMode::RequestReply
        }
    }
}

/// Where a registration listens: one transport subscription per route
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    pub subject: String,
    pub queue_group: Option<String>,
}

impl Route {
    /// Route a registration pattern
    pub fn for_registration(pattern: &Pattern) -> Result<Self, RelayError> {
        let subject = subject(pattern)?;
        let queue_group = if pattern.is_pubsub() {
            None
        } else {
            Some(
                pattern
                    .queue()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}{}", DEFAULT_QUEUE_PREFIX, subject)),
            )
        };
        Ok(Self { subject, queue_group })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.queue_group {
            Some(group) => write!(f, "{} [{}]", self.subject, group),
            None => f.write_str(&self.subject),
        }
    }
}

/// Subject an outbound call is published on
pub fn subject(pattern: &Pattern) -> Result<String, RelayError> {
    pattern
        .topic()
        .map(str::to_string)
        .ok_or_else(|| RelayError::Validation(format!("pattern {{{}}} has no topic", pattern)))
}
