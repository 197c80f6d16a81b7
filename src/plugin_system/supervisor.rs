//! Plugin boot supervisor
//!
//! Plugins boot one at a time in registration order. A plugin registered from
//! inside another plugin's init runs right after its parent, before the
//! parent's remaining siblings. The first failure or timeout stops the boot
//! and the plugins still queued are discarded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::types::{Done, PluginDescriptor, PluginMeta, PluginSlot, PluginState};
use crate::relay::{Relay, RelayError};

#[derive(Default)]
struct Queue {
    pending: VecDeque<PluginDescriptor>,
    /// Name of the plugin currently booting
    running: Option<String>,
    /// Registered by the running plugin, waiting for it to finish
    children: Vec<PluginDescriptor>,
    /// Every plugin that started booting, in order
    booted: Vec<Arc<PluginSlot>>,
}

#[derive(Default)]
pub struct BootSupervisor {
    queue: Mutex<Queue>,
}

impl BootSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a plugin for the next boot
    pub fn register(&self, mut descriptor: PluginDescriptor) {
        let mut queue = self.lock();
        match queue.running.clone() {
            Some(parent) => {
                tracing::debug!(
                    plugin = %descriptor.name(),
                    parent = %parent,
                    "nested plugin registered"
                );
                descriptor.parent = Some(parent);
                queue.children.push(descriptor);
            }
            None => queue.pending.push_back(descriptor),
        }
    }

    /// Plugins queued and not yet booted
    pub fn pending(&self) -> Vec<PluginMeta> {
        self.lock().pending.iter().map(|d| d.meta.clone()).collect()
    }

    /// Plugins that started booting and where they ended up
    pub fn states(&self) -> Vec<(PluginMeta, PluginState)> {
        self.lock()
            .booted
            .iter()
            .map(|slot| (slot.meta.clone(), slot.state()))
            .collect()
    }

    /// Boot every queued plugin
    ///
    /// `timeout` applies to each plugin separately; `None` waits forever.
    pub async fn boot(&self, relay: &Relay, timeout: Option<Duration>) -> Result<(), RelayError> {
        let boot_id = Uuid::new_v4().simple().to_string();
        tracing::debug!(boot_id = %boot_id, queued = self.lock().pending.len(), "boot started");

        while let Some((descriptor, slot)) = self.start_next() {
            let result = run_plugin(relay, &descriptor, &slot, timeout).await;
            let mut queue = self.lock();
            queue.running = None;
            let children = std::mem::take(&mut queue.children);

            if let Err(err) = result {
                let discarded = queue.pending.len() + children.len();
                queue.pending.clear();
                tracing::error!(
                    boot_id = %boot_id,
                    plugin = %descriptor.name(),
                    discarded,
                    error = %err,
                    "plugin boot failed"
                );
                return Err(err);
            }

            for child in children.into_iter().rev() {
                queue.pending.push_front(child);
            }
            tracing::info!(boot_id = %boot_id, plugin = %descriptor.name(), "plugin ready");
        }

        tracing::debug!(boot_id = %boot_id, "boot complete");
        Ok(())
    }

    fn start_next(&self) -> Option<(PluginDescriptor, Arc<PluginSlot>)> {
        let mut queue = self.lock();
        let descriptor = queue.pending.pop_front()?;
        let slot = Arc::new(PluginSlot::new(descriptor.meta.clone()));
        slot.transition(PluginState::Pending, PluginState::Running);
        queue.running = Some(descriptor.name().to_string());
        queue.booted.push(Arc::clone(&slot));
        Some((descriptor, slot))
    }
}

async fn run_plugin(
    relay: &Relay,
    descriptor: &PluginDescriptor,
    slot: &Arc<PluginSlot>,
    timeout: Option<Duration>,
) -> Result<(), RelayError> {
    let (sender, mut receiver) = oneshot::channel();
    let done = Done::new(Arc::clone(slot), sender);
    let task = tokio::spawn((descriptor.init)(
        relay.clone(),
        descriptor.meta.options.clone(),
        done,
    ));

    let signal = match timeout {
        None => Some((&mut receiver).await),
        Some(limit) => match tokio::time::timeout(limit, &mut receiver).await {
            Ok(signal) => Some(signal),
            Err(_) if slot.transition(PluginState::Running, PluginState::TimedOut) => None,
            // The signal won the race against the timer
            Err(_) => Some(receiver.await),
        },
    };

    let Some(signal) = signal else {
        task.abort();
        return Err(RelayError::PluginTimeout {
            plugin: descriptor.meta.clone(),
            timeout: timeout.unwrap_or_default(),
        });
    };

    match signal {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(RelayError::PluginFailed {
            plugin: descriptor.meta.clone(),
            source,
        }),
        Err(_) => Err(RelayError::PluginFailed {
            plugin: descriptor.meta.clone(),
            source: anyhow::anyhow!("completion signal lost"),
        }),
    }
}
