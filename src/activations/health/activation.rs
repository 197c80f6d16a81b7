use serde_json::{json, Value};
use std::time::Instant;

use super::types::HealthEvent;
use crate::plugin_system::PluginDescriptor;
use crate::relay::{BusinessError, Relay, RelayError};

/// Health service: answers `{topic: "health", cmd: "check"}`
#[derive(Clone)]
pub struct Health {
    start_time: Instant,
}

impl Health {
    /// Topic the service listens on
    pub const NAMESPACE: &'static str = "health";
    pub const VERSION: &'static str = "1.0.0";

    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    fn check(&self, relay: &Relay) -> HealthEvent {
        HealthEvent::Status {
            status: "healthy".to_string(),
            relay: relay.config().name.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    async fn install(self, relay: Relay) -> Result<(), RelayError> {
        relay
            .add(json!({"topic": Self::NAMESPACE, "cmd": "check"}), move |req| {
                let event = self.check(req.relay());
                async move { to_reply(event) }
            })
            .await?;
        Ok(())
    }

    /// The service packaged as a plugin
    pub fn plugin(self) -> PluginDescriptor {
        PluginDescriptor::new(Self::NAMESPACE, move |relay, _options, done| {
            let health = self.clone();
            async move {
                match health.install(relay).await {
                    Ok(()) => done.ok(),
                    Err(err) => done.fail(err),
                }
            }
        })
        .with_options(json!({"version": Self::VERSION}))
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

fn to_reply(event: HealthEvent) -> Result<Value, BusinessError> {
    serde_json::to_value(event).map_err(|e| BusinessError::new(e.to_string()))
}
