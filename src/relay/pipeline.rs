//! Extension pipeline
//!
//! Hooks are grouped into named stages that wrap every call. On the server a
//! call runs `onRequest` → `preHandler` → handler → `preResponse` → `onSend`;
//! on the client `onClientPreRequest` → transmit → `onClientPostRequest` once
//! per inbound reply.
//!
//! Rules shared by every stage:
//! - hooks run strictly in registration order;
//! - a hook returning `Err` ends its stage and skips the following stages up
//!   to the send stages, which always run;
//! - the first error recorded is kept, later ones are dropped;
//! - the first `response.send` commits the reply, later sends are no-ops.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::context::CallContext;
use super::errors::{BusinessError, RelayError};
use super::types::Reply;
use crate::types::Pattern;

/// Named extension point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    OnRequest,
    PreHandler,
    PreResponse,
    OnSend,
    OnClientPreRequest,
    OnClientPostRequest,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::OnRequest,
        Stage::PreHandler,
        Stage::PreResponse,
        Stage::OnSend,
        Stage::OnClientPreRequest,
        Stage::OnClientPostRequest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::OnRequest => "onRequest",
            Stage::PreHandler => "preHandler",
            Stage::PreResponse => "preResponse",
            Stage::OnSend => "onSend",
            Stage::OnClientPreRequest => "onClientPreRequest",
            Stage::OnClientPostRequest => "onClientPostRequest",
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Stage::OnClientPreRequest | Stage::OnClientPostRequest)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| RelayError::Validation(format!("unknown extension stage '{}'", s)))
    }
}

/// Future returned by a hook; `Err` is the hook's `next(error)`
pub type HookFuture = BoxFuture<'static, Result<(), BusinessError>>;

/// Type-erased hook
pub type Hook = Arc<dyn Fn(Exchange) -> HookFuture + Send + Sync>;

/// Box a closure into a [`Hook`]
pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn(Exchange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BusinessError>> + Send + 'static,
{
    Arc::new(move |exchange| Box::pin(f(exchange)) as HookFuture)
}

/// Registered hooks, copy-on-write per stage
///
/// Cloning is cheap and yields a snapshot that later registrations do not
/// affect, so a call in flight always sees the hook lists it started with.
#[derive(Clone, Default)]
pub struct Extensions {
    stages: BTreeMap<Stage, Arc<Vec<Hook>>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage, hook: Hook) {
        Arc::make_mut(self.stages.entry(stage).or_default()).push(hook);
    }

    pub fn hooks(&self, stage: Stage) -> &[Hook] {
        self.stages.get(&stage).map(|hooks| hooks.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self, stage: Stage) -> usize {
        self.hooks(stage).len()
    }
}

#[derive(Default)]
struct ExchangeState {
    /// Reply committed by the first `send`
    committed: Option<Reply>,
    /// First error raised through a hook's `next(error)`
    error: Option<BusinessError>,
    /// Reply read off the wire before the client hooks ran
    upstream: Option<Reply>,
}

/// What every hook receives
#[derive(Clone)]
pub struct Exchange {
    pub context: Arc<CallContext>,
    pub request: RequestView,
    pub response: ResponseHandle,
}

impl Exchange {
    pub fn new(context: Arc<CallContext>) -> Self {
        Self::with_state(context, ExchangeState::default())
    }

    /// Exchange around a reply that is already committed
    ///
    /// Used for a handler's reply on the server: hooks in the send stages see
    /// it, but their sends and errors no longer change what goes out.
    pub fn answered(context: Arc<CallContext>, reply: Reply) -> Self {
        Self::with_state(
            context,
            ExchangeState {
                committed: Some(reply),
                ..ExchangeState::default()
            },
        )
    }

    /// Exchange around a reply the hooks may still override
    ///
    /// Used for a reply read off the wire on the client.
    pub fn with_reply(context: Arc<CallContext>, reply: Reply) -> Self {
        Self::with_state(
            context,
            ExchangeState {
                upstream: Some(reply),
                ..ExchangeState::default()
            },
        )
    }

    fn with_state(context: Arc<CallContext>, state: ExchangeState) -> Self {
        let state = Arc::new(Mutex::new(state));
        Self {
            request: RequestView {
                context: Arc::clone(&context),
                state: Arc::clone(&state),
            },
            response: ResponseHandle { state },
            context,
        }
    }

    /// Record a pipeline error
    ///
    /// Dropped when a reply is already committed or an error is already
    /// known, including one that came from upstream.
    pub fn fail(&self, error: BusinessError) -> bool {
        let mut state = lock(&self.response.state);
        let upstream_failed = matches!(state.upstream, Some(Reply::Error(_)));
        if state.committed.is_some() || state.error.is_some() || upstream_failed {
            tracing::debug!(error = %error, "dropping error, the reply is already settled");
            return false;
        }
        state.error = Some(error);
        true
    }

    /// Whether processing already produced a reply or an error
    pub fn is_settled(&self) -> bool {
        let state = lock(&self.response.state);
        state.committed.is_some() || state.error.is_some()
    }

    pub fn has_error(&self) -> bool {
        lock(&self.response.state).error.is_some()
    }

    /// The reply this exchange resolves to
    ///
    /// A committed send wins, then a recorded error, then the upstream reply.
    /// With none of them the call answers `null`.
    pub fn outcome(&self) -> Reply {
        let state = lock(&self.response.state);
        if let Some(reply) = &state.committed {
            return reply.clone();
        }
        if let Some(err) = &state.error {
            return Reply::Error(err.clone());
        }
        state
            .upstream
            .clone()
            .unwrap_or(Reply::Payload(Value::Null))
    }
}

/// Read-only view of the call
#[derive(Clone)]
pub struct RequestView {
    context: Arc<CallContext>,
    state: Arc<Mutex<ExchangeState>>,
}

impl RequestView {
    pub fn pattern(&self) -> &Pattern {
        &self.context.pattern
    }

    /// The call's terminal error so far, if any
    pub fn error(&self) -> Option<BusinessError> {
        let state = lock(&self.state);
        state
            .error
            .as_ref()
            .or_else(|| state.committed.as_ref().and_then(Reply::error))
            .or_else(|| state.upstream.as_ref().and_then(Reply::error))
            .cloned()
    }
}

/// Write side of the call's reply
#[derive(Clone)]
pub struct ResponseHandle {
    state: Arc<Mutex<ExchangeState>>,
}

impl ResponseHandle {
    /// Commit a payload or error
    ///
    /// Only the first send is kept. Returns whether this one was.
    pub fn send(&self, reply: impl Into<Reply>) -> bool {
        let mut state = lock(&self.state);
        if state.committed.is_some() {
            tracing::debug!("reply already sent, ignoring");
            return false;
        }
        state.committed = Some(reply.into());
        true
    }

    pub fn is_sent(&self) -> bool {
        lock(&self.state).committed.is_some()
    }

    /// Payload of the committed (or upstream) reply
    pub fn payload(&self) -> Option<Value> {
        self.current().and_then(|reply| reply.payload().cloned())
    }

    /// Error of the committed (or upstream) reply
    pub fn error(&self) -> Option<BusinessError> {
        self.current().and_then(|reply| reply.error().cloned())
    }

    fn current(&self) -> Option<Reply> {
        let state = lock(&self.state);
        state.committed.clone().or_else(|| state.upstream.clone())
    }
}

fn lock(state: &Mutex<ExchangeState>) -> MutexGuard<'_, ExchangeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one stage's hooks against `exchange`
///
/// Returns `false` if a hook failed; its error has been recorded.
pub async fn run_stage(hooks: &[Hook], stage: Stage, exchange: &Exchange) -> bool {
    for (index, hook) in hooks.iter().enumerate() {
        if let Err(err) = hook(exchange.clone()).await {
            tracing::debug!(
                stage = %stage,
                hook = index,
                request_id = %exchange.context.id,
                error = %err,
                "extension aborted stage"
            );
            exchange.fail(err);
            return false;
        }
    }
    true
}
