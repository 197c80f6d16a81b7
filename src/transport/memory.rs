use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use super::{Message, Subscription, SubscriptionId, Transport, TransportError};

struct Subscriber {
    subject: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Broker {
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    /// Round-robin cursor per (subject, queue group)
    cursors: HashMap<(String, String), usize>,
    closed: bool,
}

/// In-process broker with NATS-like delivery
///
/// Plain subscribers all receive every message on their subject. Subscribers
/// that share a queue group receive each message exactly once between them,
/// and every distinct group on a subject gets its own copy. Cloning yields a
/// handle to the same broker, so several relays can share one "network".
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Mutex<Broker>>,
    next_sid: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse further traffic and end every subscription
    pub fn shutdown(&self) {
        let mut broker = self.broker.lock().unwrap_or_else(PoisonError::into_inner);
        broker.closed = true;
        broker.subscribers.clear();
    }

    /// Number of live subscriptions, optionally restricted to one subject
    pub fn subscription_count(&self, subject: Option<&str>) -> usize {
        let broker = self.broker.lock().unwrap_or_else(PoisonError::into_inner);
        broker
            .subscribers
            .values()
            .filter(|sub| subject.map_or(true, |s| sub.subject == s))
            .count()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply_to: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut broker = self.broker.lock().unwrap_or_else(PoisonError::into_inner);
        if broker.closed {
            return Err(TransportError::Closed);
        }

        let message = Message {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload,
        };

        let mut targets = Vec::new();
        let mut groups: BTreeMap<&str, Vec<SubscriptionId>> = BTreeMap::new();
        for (sid, sub) in broker.subscribers.iter().filter(|(_, s)| s.subject == subject) {
            match &sub.queue_group {
                Some(group) => groups.entry(group.as_str()).or_default().push(*sid),
                None => targets.push(*sid),
            }
        }
        let groups: Vec<(String, Vec<SubscriptionId>)> = groups
            .into_iter()
            .map(|(group, members)| (group.to_string(), members))
            .collect();

        for (group, members) in groups {
            let cursor = broker
                .cursors
                .entry((subject.to_string(), group))
                .or_insert(0);
            let chosen = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            targets.push(chosen);
        }

        for sid in targets {
            if let Some(sub) = broker.subscribers.get(&sid) {
                // A dropped receiver is cleaned up on unsubscribe
                let _ = sub.sender.send(message.clone());
            }
        }

        tracing::trace!(subject = %subject, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        let mut broker = self.broker.lock().unwrap_or_else(PoisonError::into_inner);
        if broker.closed {
            return Err(TransportError::Closed);
        }

        let sid = SubscriptionId(self.next_sid.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = mpsc::unbounded_channel();
        broker.subscribers.insert(
            sid,
            Subscriber {
                subject: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                sender,
            },
        );

        tracing::debug!(%sid, subject = %subject, queue = ?queue_group, "subscribed");
        Ok(Subscription {
            sid,
            messages: UnboundedReceiverStream::new(receiver),
        })
    }

    fn unsubscribe(&self, sid: SubscriptionId) -> Result<(), TransportError> {
        let mut broker = self.broker.lock().unwrap_or_else(PoisonError::into_inner);
        match broker.subscribers.remove(&sid) {
            Some(sub) => {
                tracing::debug!(%sid, subject = %sub.subject, "unsubscribed");
                Ok(())
            }
            None => Err(TransportError::UnknownSubscription(sid)),
        }
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    async fn try_next(sub: &mut Subscription) -> Option<Message> {
        tokio::time::timeout(Duration::from_millis(50), sub.messages.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_plain_subscribers_all_receive() {
        let transport = MemoryTransport::new();
        let mut a = transport.subscribe("email", None).await.unwrap();
        let mut b = transport.subscribe("email", None).await.unwrap();

        transport.publish("email", b"hi".to_vec(), None).await.unwrap();

        assert_eq!(try_next(&mut a).await.unwrap().payload, b"hi");
        assert_eq!(try_next(&mut b).await.unwrap().payload, b"hi");
    }

    #[tokio::test]
    async fn test_queue_group_members_compete() {
        let transport = MemoryTransport::new();
        let mut a = transport.subscribe("email", Some("q")).await.unwrap();
        let mut b = transport.subscribe("email", Some("q")).await.unwrap();

        transport.publish("email", b"1".to_vec(), None).await.unwrap();
        transport.publish("email", b"2".to_vec(), None).await.unwrap();

        let first = try_next(&mut a).await.unwrap();
        let second = try_next(&mut b).await.unwrap();
        assert_eq!(first.payload, b"1");
        assert_eq!(second.payload, b"2");
        assert!(try_next(&mut a).await.is_none());
        assert!(try_next(&mut b).await.is_none());
    }

    #[tokio::test]
    async fn test_each_queue_group_gets_a_copy() {
        let transport = MemoryTransport::new();
        let mut a = transport.subscribe("email", Some("A")).await.unwrap();
        let mut b = transport.subscribe("email", Some("B")).await.unwrap();

        transport
            .publish("email", b"x".to_vec(), Some("_INBOX.1"))
            .await
            .unwrap();

        let got_a = try_next(&mut a).await.unwrap();
        assert_eq!(got_a.reply_to.as_deref(), Some("_INBOX.1"));
        assert!(try_next(&mut b).await.is_some());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let transport = MemoryTransport::new();
        transport.publish("nobody", Vec::new(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe("email", None).await.unwrap();
        transport.unsubscribe(sub.sid).unwrap();
        assert!(sub.messages.next().await.is_none());
        assert_eq!(
            transport.unsubscribe(sub.sid),
            Err(TransportError::UnknownSubscription(sub.sid))
        );
    }

    #[tokio::test]
    async fn test_shutdown_rejects_traffic() {
        let transport = MemoryTransport::new();
        transport.shutdown();
        assert_eq!(
            transport.publish("email", Vec::new(), None).await,
            Err(TransportError::Closed)
        );
        assert!(transport.subscribe("email", None).await.is_err());
    }

    #[test]
    fn test_inboxes_are_unique() {
        let transport = MemoryTransport::new();
        assert_ne!(transport.new_inbox(), transport.new_inbox());
    }
}
