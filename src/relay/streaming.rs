//! Client-side reply streams
//!
//! Every request/reply call gets its own inbox subscription. Replies are read
//! from it in arrival order, each one run through the `onClientPostRequest`
//! hooks, until the call's `maxMessages$` allowance is used up. Then the inbox
//! is released. An unbounded call (`maxMessages$: -1`) keeps its inbox until
//! [`Relay::release`](super::Relay::release) is called or the stream dropped.

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use super::context::CallContext;
use super::errors::RelayError;
use super::pipeline::{run_stage, Exchange, Extensions, Stage};
use crate::transport::{Codec, Subscription, SubscriptionId, Transport};
use crate::types::MaxMessages;

/// Inbox subscriptions currently open on a relay
pub(crate) type OpenInboxes = Arc<Mutex<HashSet<SubscriptionId>>>;

/// Release an inbox subscription once; later calls are no-ops
pub(crate) fn release_inbox(
    transport: &dyn Transport,
    open: &OpenInboxes,
    sid: SubscriptionId,
) -> bool {
    let removed = open
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&sid);
    if removed {
        if let Err(err) = transport.unsubscribe(sid) {
            tracing::debug!(%sid, error = %err, "inbox already gone");
        } else {
            tracing::trace!(%sid, "inbox released");
        }
    }
    removed
}

/// Owns one inbox subscription and releases it when dropped
pub(crate) struct InboxGuard {
    sid: SubscriptionId,
    transport: Arc<dyn Transport>,
    open: OpenInboxes,
}

impl InboxGuard {
    pub(crate) fn new(
        sid: SubscriptionId,
        transport: Arc<dyn Transport>,
        open: OpenInboxes,
    ) -> Self {
        open.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sid);
        Self { sid, transport, open }
    }

    fn release(&self) -> bool {
        release_inbox(self.transport.as_ref(), &self.open, self.sid)
    }
}

impl Drop for InboxGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Everything the reader needs to turn inbox messages into replies
pub(crate) struct PendingCall {
    pub context: Arc<CallContext>,
    pub extensions: Extensions,
    pub codec: Arc<dyn Codec>,
    pub max_messages: MaxMessages,
    pub timeout: Option<Duration>,
}

/// Replies to one call, in arrival order
pub struct ReplyStream {
    sid: Option<SubscriptionId>,
    replies: Pin<Box<dyn Stream<Item = Result<Value, RelayError>> + Send>>,
    guard: Option<Arc<InboxGuard>>,
}

impl ReplyStream {
    /// A call that expects no replies
    pub(crate) fn empty() -> Self {
        Self {
            sid: None,
            replies: Box::pin(futures::stream::empty()),
            guard: None,
        }
    }

    /// A call answered without reaching the wire
    pub(crate) fn resolved(result: Result<Value, RelayError>) -> Self {
        Self {
            sid: None,
            replies: Box::pin(futures::stream::once(async move { result })),
            guard: None,
        }
    }

    pub(crate) fn open(subscription: Subscription, guard: InboxGuard, call: PendingCall) -> Self {
        let guard = Arc::new(guard);
        Self {
            sid: Some(subscription.sid),
            replies: Box::pin(read_replies(subscription, Arc::clone(&guard), call)),
            guard: Some(guard),
        }
    }

    /// Inbox subscription id, `None` when the call never opened one
    pub fn sid(&self) -> Option<SubscriptionId> {
        self.sid
    }

    /// Stop receiving; the stream ends after any replies already buffered
    pub fn release(&self) -> bool {
        self.guard.as_ref().is_some_and(|guard| guard.release())
    }
}

impl Stream for ReplyStream {
    type Item = Result<Value, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.replies.poll_next_unpin(cx)
    }
}

enum Next<T> {
    Message(T),
    Ended,
    TimedOut(Duration),
}

fn read_replies(
    subscription: Subscription,
    guard: Arc<InboxGuard>,
    call: PendingCall,
) -> impl Stream<Item = Result<Value, RelayError>> + Send {
    let mut messages = subscription.messages;
    stream! {
        let mut delivered: u64 = 0;
        loop {
            let next = match call.timeout {
                Some(limit) => match tokio::time::timeout(limit, messages.next()).await {
                    Ok(Some(message)) => Next::Message(message),
                    Ok(None) => Next::Ended,
                    Err(_) => Next::TimedOut(limit),
                },
                None => match messages.next().await {
                    Some(message) => Next::Message(message),
                    None => Next::Ended,
                },
            };

            let message = match next {
                Next::Message(message) => message,
                Next::Ended => break,
                Next::TimedOut(limit) => {
                    tracing::debug!(request_id = %call.context.id, ?limit, "no reply in time");
                    yield Err(RelayError::RequestTimeout {
                        method: call.context.pattern.method(),
                        timeout: limit,
                    });
                    break;
                }
            };

            let response = match call.codec.decode_response(&message.payload) {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        request_id = %call.context.id,
                        error = %err,
                        "undecodable reply"
                    );
                    delivered += 1;
                    yield Err(err);
                    if call.max_messages.is_exhausted(delivered) {
                        break;
                    }
                    continue;
                }
            };

            // An empty id marks a reply to a request the responder could not decode
            if !response.id.is_empty() && response.id != call.context.id {
                tracing::trace!(
                    request_id = %call.context.id,
                    reply_id = %response.id,
                    "skipping foreign reply"
                );
                continue;
            }

            let exchange = Exchange::with_reply(Arc::clone(&call.context), response.reply);
            run_stage(
                call.extensions.hooks(Stage::OnClientPostRequest),
                Stage::OnClientPostRequest,
                &exchange,
            )
            .await;

            delivered += 1;
            yield exchange.outcome().into_result().map_err(RelayError::from);
            if call.max_messages.is_exhausted(delivered) {
                break;
            }
        }
        guard.release();
    }
}
