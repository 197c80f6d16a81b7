use futures::{Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::context::CallContext;
use super::errors::{BusinessError, RelayError};
use super::relay::Relay;
use super::streaming::ReplyStream;
use crate::types::{IntoPattern, Pattern};

/// Replies produced by a handler, one envelope per item
pub type HandlerStream = Pin<Box<dyn Stream<Item = Result<Value, BusinessError>> + Send + 'static>>;

/// What a registration runs for each inbound call
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request) -> HandlerStream;
}

/// Unary handler: one reply per call
pub(crate) struct UnaryHandler<F>(pub F);

impl<F, Fut> Handler for UnaryHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BusinessError>> + Send + 'static,
{
    fn call(&self, request: Request) -> HandlerStream {
        Box::pin(futures::stream::once((self.0)(request)))
    }
}

/// Streaming handler: any number of replies per call
pub(crate) struct StreamingHandler<F>(pub F);

impl<F, S> Handler for StreamingHandler<F>
where
    F: Fn(Request) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Value, BusinessError>> + Send + 'static,
{
    fn call(&self, request: Request) -> HandlerStream {
        (self.0)(request).boxed()
    }
}

/// An inbound call as seen by its handler
///
/// Nested calls made through [`Request::act`] continue this call's trace but
/// never see its delegate.
#[derive(Clone)]
pub struct Request {
    context: Arc<CallContext>,
    relay: Relay,
}

impl Request {
    pub(crate) fn new(context: Arc<CallContext>, relay: Relay) -> Self {
        Self { context, relay }
    }

    pub fn pattern(&self) -> &Pattern {
        &self.context.pattern
    }

    /// Shorthand for a field of the inbound pattern
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.pattern.get(key)
    }

    pub fn delegate(&self) -> Option<&Value> {
        self.context.delegate()
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Issue a nested call on behalf of this request
    pub async fn act(&self, pattern: impl IntoPattern) -> Result<Value, RelayError> {
        self.relay
            .act_within(pattern.into_pattern()?, Some(self.context.as_ref()))
            .await
    }

    /// Issue a nested streaming call on behalf of this request
    pub async fn act_stream(&self, pattern: impl IntoPattern) -> Result<ReplyStream, RelayError> {
        self.relay
            .act_stream_within(pattern.into_pattern()?, Some(self.context.as_ref()))
            .await
    }
}
