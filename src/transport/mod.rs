//! Publish/subscribe transport boundary
//!
//! The relay never touches sockets itself. It publishes opaque payloads on
//! subjects and reads from subscriptions, optionally inside a queue group.
//! [`MemoryTransport`] is the in-process broker used by the binary and tests.

pub mod codec;
pub mod memory;

use async_trait::async_trait;
use std::fmt;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub use codec::{Codec, JsonCodec};
pub use memory::MemoryTransport;

/// Identifier of one subscription on a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid-{}", self.0)
    }
}

/// A message as delivered by the transport
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    /// Where the receiver should publish its reply, if one is expected
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// Live subscription: a stream of messages that ends once unsubscribed
pub struct Subscription {
    pub sid: SubscriptionId,
    pub messages: UnboundedReceiverStream<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),
    #[error("Publish to '{subject}' failed: {reason}")]
    Publish { subject: String, reason: String },
}

/// Pub/sub transport collaborator
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish `payload` on `subject`, resolving once the transport accepted it
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply_to: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Subscribe to `subject`; members of one queue group compete for messages
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError>;

    /// Stop a subscription; its message stream ends
    fn unsubscribe(&self, sid: SubscriptionId) -> Result<(), TransportError>;

    /// A fresh, unique subject for receiving replies
    fn new_inbox(&self) -> String;
}
