//! The relay instance
//!
//! A [`Relay`] is a cheap handle around shared state. It registers handlers
//! (one transport subscription per route), issues calls, runs the extension
//! pipeline on both sides of the wire and boots plugins.

use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use super::addressing::{self, DeliveryMode, Route};
use super::context::CallContext;
use super::dispatch;
use super::errors::{BusinessError, RelayError};
use super::handler::{Handler, Request, StreamingHandler, UnaryHandler};
use super::pipeline::{self, run_stage, Exchange, Extensions, Stage};
use super::registry::{RegistrationId, Registry, Resolution};
use super::streaming::{self, InboxGuard, OpenInboxes, PendingCall, ReplyStream};
use crate::config::RelayConfig;
use crate::plugin_system::{BootSupervisor, PluginDescriptor, PluginMeta, PluginState};
use crate::transport::{Codec, JsonCodec, SubscriptionId, Transport};
use crate::types::{IntoPattern, Pattern};

/// Observer told about every error a handler-side call answers with
pub type ErrorHandler = Arc<dyn Fn(&CallContext, &BusinessError) + Send + Sync>;

struct RelayInner {
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    registry: RwLock<Registry>,
    /// Transport subscription backing each route
    listeners: Mutex<HashMap<Route, SubscriptionId>>,
    inboxes: OpenInboxes,
    extensions: RwLock<Extensions>,
    error_handler: RwLock<Option<ErrorHandler>>,
    plugins: BootSupervisor,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Relay speaking JSON over `transport`
    pub fn new(transport: impl Transport, config: RelayConfig) -> Self {
        Self::with_codec(transport, JsonCodec, config)
    }

    pub fn with_codec(transport: impl Transport, codec: impl Codec, config: RelayConfig) -> Self {
        tracing::debug!(name = %config.name, "relay created");
        Self {
            inner: Arc::new(RelayInner {
                config,
                transport: Arc::new(transport),
                codec: Arc::new(codec),
                registry: RwLock::new(Registry::new()),
                listeners: Mutex::new(HashMap::new()),
                inboxes: OpenInboxes::default(),
                extensions: RwLock::new(Extensions::new()),
                error_handler: RwLock::new(None),
                plugins: BootSupervisor::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub(crate) fn codec(&self) -> &dyn Codec {
        self.inner.codec.as_ref()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    fn ensure_open(&self) -> Result<(), RelayError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RelayError::Closed);
        }
        Ok(())
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a handler answering once per call
    pub async fn add<F, Fut>(
        &self,
        pattern: impl IntoPattern,
        handler: F,
    ) -> Result<RegistrationId, RelayError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BusinessError>> + Send + 'static,
    {
        self.register(pattern.into_pattern()?, Arc::new(UnaryHandler(handler)))
            .await
    }

    /// Register a handler answering with any number of replies per call
    pub async fn add_stream<F, S>(
        &self,
        pattern: impl IntoPattern,
        handler: F,
    ) -> Result<RegistrationId, RelayError>
    where
        F: Fn(Request) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, BusinessError>> + Send + 'static,
    {
        self.register(pattern.into_pattern()?, Arc::new(StreamingHandler(handler)))
            .await
    }

    async fn register(
        &self,
        pattern: Pattern,
        handler: Arc<dyn Handler>,
    ) -> Result<RegistrationId, RelayError> {
        self.ensure_open()?;
        let route = Route::for_registration(&pattern)?;
        let (registration, first) = self.registry_mut().insert(pattern, route.clone(), handler);

        if first {
            if let Err(err) = self.listen(&route).await {
                self.registry_mut().remove(registration.id);
                return Err(err);
            }
        }

        tracing::debug!(
            registration = %registration.id,
            route = %route,
            method = %registration.pattern.method(),
            "handler registered"
        );
        Ok(registration.id)
    }

    /// Open the subscription for `route` and serve what arrives on it
    async fn listen(&self, route: &Route) -> Result<(), RelayError> {
        let subscription = self
            .inner
            .transport
            .subscribe(&route.subject, route.queue_group.as_deref())
            .await?;
        self.listeners().insert(route.clone(), subscription.sid);

        let relay: Weak<RelayInner> = Arc::downgrade(&self.inner);
        let route = route.clone();
        let mut messages = subscription.messages;
        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let Some(inner) = relay.upgrade() else {
                    break;
                };
                tokio::spawn(dispatch::serve(Relay { inner }, route.clone(), message));
            }
            tracing::debug!(route = %route, "listener stopped");
        });
        Ok(())
    }

    /// Remove a registration; the route's subscription goes with its last one
    pub fn remove(&self, id: RegistrationId) -> bool {
        let Some((registration, emptied)) = self.registry_mut().remove(id) else {
            return false;
        };
        if emptied {
            self.unlisten(&registration.route);
        }
        tracing::debug!(registration = %id, "handler removed");
        true
    }

    fn unlisten(&self, route: &Route) {
        let Some(sid) = self.listeners().remove(route) else {
            return;
        };
        if let Err(err) = self.inner.transport.unsubscribe(sid) {
            tracing::debug!(route = %route, error = %err, "route subscription already gone");
        }
    }

    pub(crate) fn resolve(&self, route: &Route, request: &Pattern) -> Resolution {
        self.registry().resolve(route, request)
    }

    /// Routing identities of every registration, sorted
    pub fn list_patterns(&self) -> Vec<String> {
        self.registry().list()
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call a remote handler and wait for its first reply
    ///
    /// `pubsub$` calls resolve with `null` as soon as they are published.
    pub async fn act(&self, pattern: impl IntoPattern) -> Result<Value, RelayError> {
        self.act_within(pattern.into_pattern()?, None).await
    }

    /// Call a remote handler and stream every reply it sends
    pub async fn act_stream(&self, pattern: impl IntoPattern) -> Result<ReplyStream, RelayError> {
        self.act_stream_within(pattern.into_pattern()?, None).await
    }

    pub(crate) async fn act_within(
        &self,
        pattern: Pattern,
        parent: Option<&CallContext>,
    ) -> Result<Value, RelayError> {
        let publish = DeliveryMode::of(&pattern) == DeliveryMode::Publish;
        let mut replies = self.act_stream_within(pattern, parent).await?;
        match replies.next().await {
            Some(reply) => reply,
            None if publish => Ok(Value::Null),
            None => Err(RelayError::Closed),
        }
    }

    pub(crate) async fn act_stream_within(
        &self,
        pattern: Pattern,
        parent: Option<&CallContext>,
    ) -> Result<ReplyStream, RelayError> {
        self.ensure_open()?;
        let mode = DeliveryMode::of(&pattern);
        let subject = addressing::subject(&pattern)?;
        let max_messages = pattern.max_messages()?;
        let timeout = pattern
            .timeout_ms()?
            .map(Duration::from_millis)
            .or_else(|| self.inner.config.request_timeout());

        let context = Arc::new(CallContext::outbound(pattern, parent));
        let extensions = self.extensions();

        let exchange = Exchange::new(Arc::clone(&context));
        run_stage(
            extensions.hooks(Stage::OnClientPreRequest),
            Stage::OnClientPreRequest,
            &exchange,
        )
        .await;
        if exchange.is_settled() {
            tracing::debug!(request_id = %context.id, "call answered before transmission");
            return Ok(ReplyStream::resolved(
                exchange.outcome().into_result().map_err(RelayError::from),
            ));
        }

        let payload = self.inner.codec.encode_request(&context.to_request())?;
        tracing::debug!(
            request_id = %context.id,
            subject = %subject,
            method = %context.pattern.method(),
            "sending call"
        );

        if mode == DeliveryMode::Publish {
            self.inner.transport.publish(&subject, payload, None).await?;
            return Ok(ReplyStream::empty());
        }

        // The inbox must exist before the request can be answered
        let inbox = self.inner.transport.new_inbox();
        let subscription = self.inner.transport.subscribe(&inbox, None).await?;
        let guard = InboxGuard::new(
            subscription.sid,
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.inboxes),
        );
        let replies = ReplyStream::open(
            subscription,
            guard,
            PendingCall {
                context,
                extensions,
                codec: Arc::clone(&self.inner.codec),
                max_messages,
                timeout,
            },
        );

        self.inner
            .transport
            .publish(&subject, payload, Some(&inbox))
            .await?;
        Ok(replies)
    }

    /// Stop an open reply stream by its inbox subscription id
    pub fn release(&self, sid: SubscriptionId) -> bool {
        streaming::release_inbox(self.inner.transport.as_ref(), &self.inner.inboxes, sid)
    }

    // ========================================================================
    // Extensions
    // ========================================================================

    /// Append a hook to `stage`
    ///
    /// Calls already in flight keep the hook lists they started with.
    pub fn ext<F, Fut>(&self, stage: Stage, hook: F)
    where
        F: Fn(Exchange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BusinessError>> + Send + 'static,
    {
        self.inner
            .extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stage, pipeline::hook(hook));
        tracing::debug!(stage = %stage, "extension added");
    }

    pub(crate) fn extensions(&self) -> Extensions {
        self.inner
            .extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Observe every error answered by a handler registered on this relay
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&CallContext, &BusinessError) + Send + Sync + 'static,
    {
        *self
            .inner
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub(crate) fn report_error(&self, context: &CallContext, error: &BusinessError) {
        let handler = self
            .inner
            .error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(context, error);
        }
    }

    // ========================================================================
    // Plugins
    // ========================================================================

    /// Queue a plugin; it boots on the next [`Relay::ready`]
    pub fn use_plugin(&self, plugin: PluginDescriptor) {
        self.inner.plugins.register(plugin);
    }

    /// Boot every queued plugin in order
    pub async fn ready(&self) -> Result<(), RelayError> {
        self.ensure_open()?;
        self.inner
            .plugins
            .boot(self, self.inner.config.plugin_timeout())
            .await
    }

    /// Plugins booted so far and their final state
    pub fn plugins(&self) -> Vec<(PluginMeta, PluginState)> {
        self.inner.plugins.states()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Drop every registration and release every subscription
    ///
    /// Calling it again does nothing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.registry_mut().clear();
        let listeners: Vec<SubscriptionId> = self.listeners().drain().map(|(_, sid)| sid).collect();
        for sid in listeners {
            let _ = self.inner.transport.unsubscribe(sid);
        }
        let inboxes: Vec<SubscriptionId> = self
            .inner
            .inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        for sid in inboxes {
            self.release(sid);
        }
        tracing::info!(name = %self.inner.config.name, "relay closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<Route, SubscriptionId>> {
        self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn relay() -> (Relay, MemoryTransport) {
        let transport = MemoryTransport::new();
        (Relay::new(transport.clone(), RelayConfig::default()), transport)
    }

    #[tokio::test]
    async fn test_act_roundtrip() {
        let (relay, _) = relay();
        relay
            .add(json!({"topic": "math", "cmd": "add"}), |req: Request| async move {
                let a = req.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = req.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            })
            .await
            .unwrap();

        let result = relay
            .act(json!({"topic": "math", "cmd": "add", "a": 1, "b": 2}))
            .await
            .unwrap();
        assert_eq!(result, json!(3));
    }

    #[tokio::test]
    async fn test_unmatched_call_is_pattern_not_found() {
        let (relay, _) = relay();
        relay
            .add(json!({"topic": "math", "cmd": "add"}), |_| async { Ok(json!(0)) })
            .await
            .unwrap();

        let err = relay.act(json!({"topic": "math", "cmd": "mul"})).await.unwrap_err();
        assert_eq!(err.code(), "ERR_PATTERN_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_one_subscription_per_route() {
        let (relay, transport) = relay();
        let add = relay
            .add(json!({"topic": "math", "cmd": "add"}), |_| async { Ok(json!(0)) })
            .await
            .unwrap();
        let sub = relay
            .add(json!({"topic": "math", "cmd": "sub"}), |_| async { Ok(json!(0)) })
            .await
            .unwrap();
        assert_eq!(transport.subscription_count(Some("math")), 1);

        assert!(relay.remove(add));
        assert_eq!(transport.subscription_count(Some("math")), 1);
        assert!(relay.remove(sub));
        assert_eq!(transport.subscription_count(Some("math")), 0);
        assert!(!relay.remove(sub));
    }

    #[tokio::test]
    async fn test_inbox_released_after_reply() {
        let (relay, transport) = relay();
        relay
            .add(json!({"topic": "health"}), |_| async { Ok(json!("ok")) })
            .await
            .unwrap();
        relay.act(json!({"topic": "health"})).await.unwrap();
        assert_eq!(transport.subscription_count(None), 1);
    }

    #[tokio::test]
    async fn test_closed_relay_refuses_work() {
        let (relay, transport) = relay();
        relay
            .add(json!({"topic": "math", "cmd": "add"}), |_| async { Ok(json!(0)) })
            .await
            .unwrap();
        relay.close();
        relay.close();
        assert!(relay.is_closed());
        assert_eq!(transport.subscription_count(None), 0);
        assert!(matches!(
            relay.act(json!({"topic": "math", "cmd": "add"})).await,
            Err(RelayError::Closed)
        ));
        assert!(relay.list_patterns().is_empty());
    }

    #[tokio::test]
    async fn test_missing_topic_is_rejected() {
        let (relay, _) = relay();
        let err = relay.act(json!({"cmd": "add"})).await.unwrap_err();
        assert_eq!(err.code(), "ERR_VALIDATION");
        assert!(relay.add(json!({"cmd": "add"}), |_| async { Ok(json!(0)) }).await.is_err());
    }
}
