//! Server-side call processing
//!
//! One task per inbound message:
//! decode → resolve → `onRequest` → `preHandler` → handler → `preResponse` →
//! `onSend` → transmit. The handler's reply is committed as it is produced, so
//! the send stages observe it but cannot replace it. A streaming handler's
//! later items each get a fresh exchange and run the send stages again before
//! going out.

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::Instrument;

use super::addressing::Route;
use super::context::{CallContext, Trace};
use super::errors::BusinessError;
use super::handler::Request;
use super::hops::{self, Hop};
use super::pipeline::{run_stage, Exchange, Extensions, Stage};
use super::registry::Resolution;
use super::relay::Relay;
use super::types::{Reply, ResponseMessage};
use crate::transport::Message;

/// Serve one message received on `route`
pub(crate) async fn serve(relay: Relay, route: Route, message: Message) {
    let request = match relay.codec().decode_request(&message.payload) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(subject = %message.subject, error = %err, "undecodable request");
            if let Some(reply_to) = message.reply_to.as_deref() {
                let response = ResponseMessage {
                    id: String::new(),
                    trace: Trace::root(),
                    reply: Reply::Error(err.into()),
                };
                publish(&relay, reply_to, &response).await;
            }
            return;
        }
    };

    let context = Arc::new(CallContext::inbound(request));
    let span = tracing::debug_span!(
        "serve",
        request_id = %context.id,
        route = %route,
        method = %context.pattern.method()
    );
    let call = ServerCall {
        extensions: relay.extensions(),
        relay,
        route,
        context,
        reply_to: message.reply_to,
    };
    call.run().instrument(span).await
}

struct ServerCall {
    relay: Relay,
    route: Route,
    context: Arc<CallContext>,
    reply_to: Option<String>,
    extensions: Extensions,
}

impl ServerCall {
    async fn run(self) {
        // Every route on the subject gets a copy; only one of them answers
        let resolution = self.relay.resolve(&self.route, &self.context.pattern);
        if let Resolution::Defer = resolution {
            tracing::trace!("call belongs to a sibling route");
            return;
        }

        let exchange = Exchange::new(Arc::clone(&self.context));
        let hooks = self.extensions.hooks(Stage::OnRequest);
        if !run_stage(hooks, Stage::OnRequest, &exchange).await {
            return self.finish(exchange).await;
        }

        let Resolution::Handle(registration) = resolution else {
            tracing::debug!("no registration matches");
            exchange.fail(BusinessError::pattern_not_found(&self.context.pattern.method()));
            return self.finish(exchange).await;
        };

        let hooks = self.extensions.hooks(Stage::PreHandler);
        if !run_stage(hooks, Stage::PreHandler, &exchange).await || exchange.is_settled() {
            return self.finish(exchange).await;
        }

        tracing::debug!(registration = %registration.id, "invoking handler");
        let mut replies = registration
            .handler
            .call(Request::new(Arc::clone(&self.context), self.relay.clone()));

        // A handler that yields nothing still answers the call
        let first = replies.next().await.unwrap_or(Ok(Value::Null));
        self.finish(Exchange::answered(Arc::clone(&self.context), first.into()))
            .await;

        while let Some(item) = replies.next().await {
            self.finish(Exchange::answered(Arc::clone(&self.context), item.into()))
                .await;
        }
    }

    /// Send stages, error bookkeeping and transmission of one reply
    async fn finish(&self, exchange: Exchange) {
        let hooks = self.extensions.hooks(Stage::PreResponse);
        run_stage(hooks, Stage::PreResponse, &exchange).await;
        run_stage(self.extensions.hooks(Stage::OnSend), Stage::OnSend, &exchange).await;

        let mut reply = exchange.outcome();
        if let Reply::Error(err) = &mut reply {
            hops::record(
                err,
                Hop::new(
                    self.route.subject.clone(),
                    self.context.pattern.method(),
                    Some(self.relay.config().name.clone()),
                    self.context.id.clone(),
                ),
            );
            self.relay.report_error(&self.context, err);
            tracing::warn!(error = %err, code = ?err.code, "call failed");
        }

        let Some(reply_to) = self.reply_to.as_deref() else {
            return;
        };
        let response = ResponseMessage {
            id: self.context.id.clone(),
            trace: self.context.trace.clone(),
            reply,
        };
        publish(&self.relay, reply_to, &response).await;
    }
}

async fn publish(relay: &Relay, reply_to: &str, response: &ResponseMessage) {
    let payload = match relay.codec().encode_response(response) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "cannot encode reply");
            return;
        }
    };
    if let Err(err) = relay.transport().publish(reply_to, payload, None).await {
        tracing::warn!(reply_to = %reply_to, error = %err, "reply not delivered");
    }
}
