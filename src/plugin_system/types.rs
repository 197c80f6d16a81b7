use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::relay::Relay;

/// Name and declared options of a plugin, reported on boot failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    #[serde(default)]
    pub options: Value,
}

impl PluginMeta {
    pub fn new(name: impl Into<String>, options: Value) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

/// Plugin init function: receives the relay, its options and a completion signal
pub type PluginFn = Arc<dyn Fn(Relay, Value, Done) -> BoxFuture<'static, ()> + Send + Sync>;

/// A plugin waiting to be booted
#[derive(Clone)]
pub struct PluginDescriptor {
    pub meta: PluginMeta,
    /// Plugin that registered this one while it was booting
    pub parent: Option<String>,
    pub(crate) init: PluginFn,
}

impl PluginDescriptor {
    /// Describe a plugin
    ///
    /// The init function must eventually call [`Done::ok`] or [`Done::fail`];
    /// returning from it is not enough.
    pub fn new<F, Fut>(name: impl Into<String>, init: F) -> Self
    where
        F: Fn(Relay, Value, Done) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            meta: PluginMeta::new(name, Value::Null),
            parent: None,
            init: Arc::new(move |relay, options, done| Box::pin(init(relay, options, done))),
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.meta.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("meta", &self.meta)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of one plugin during boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PluginState {
    Pending = 0,
    Running = 1,
    Done = 2,
    Failed = 3,
    TimedOut = 4,
}

impl PluginState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PluginState::Pending,
            1 => PluginState::Running,
            2 => PluginState::Done,
            3 => PluginState::Failed,
            _ => PluginState::TimedOut,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PluginState::Done | PluginState::Failed | PluginState::TimedOut)
    }
}

/// Shared state cell of one booting plugin
///
/// Every transition goes through a compare-and-swap, so whichever of the
/// completion signal and the timer moves the plugin out of `Running` first
/// decides its fate and the other becomes a no-op.
#[derive(Debug)]
pub struct PluginSlot {
    pub meta: PluginMeta,
    state: AtomicU8,
}

impl PluginSlot {
    pub fn new(meta: PluginMeta) -> Self {
        Self {
            meta,
            state: AtomicU8::new(PluginState::Pending as u8),
        }
    }

    pub fn state(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the slot was not in `from`
    pub fn transition(&self, from: PluginState, to: PluginState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Completion signal handed to a plugin's init function
///
/// Dropping it without signalling counts as a failure.
pub struct Done {
    slot: Arc<PluginSlot>,
    sender: Option<oneshot::Sender<Result<(), anyhow::Error>>>,
}

impl Done {
    pub(crate) fn new(
        slot: Arc<PluginSlot>,
        sender: oneshot::Sender<Result<(), anyhow::Error>>,
    ) -> Self {
        Self {
            slot,
            sender: Some(sender),
        }
    }

    /// Signal successful initialisation
    pub fn ok(mut self) {
        self.finish(Ok(()));
    }

    /// Signal failed initialisation
    pub fn fail(mut self, error: impl Into<anyhow::Error>) {
        self.finish(Err(error.into()));
    }

    fn finish(&mut self, result: Result<(), anyhow::Error>) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        let target = if result.is_ok() {
            PluginState::Done
        } else {
            PluginState::Failed
        };
        if self.slot.transition(PluginState::Running, target) {
            // The supervisor may have given up on this boot already
            let _ = sender.send(result);
        } else {
            tracing::debug!(
                plugin = %self.slot.meta.name,
                state = ?self.slot.state(),
                "ignoring late completion signal"
            );
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.finish(Err(anyhow::anyhow!(
                "plugin dropped its completion signal without calling it"
            )));
        }
    }
}
