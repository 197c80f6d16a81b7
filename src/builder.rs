//! Relay builder - constructs a relay with the bundled services booted
//!
//! This module is used by both the main binary and the integration tests.

use crate::activations::health::Health;
use crate::activations::math::{Math, MathOptions};
use crate::config::RelayConfig;
use crate::relay::{Relay, RelayError};
use crate::transport::Transport;

/// Build a relay and boot the bundled services
///
/// - `health`: `check`
/// - `math`: `add`, `sub`, streaming `count`
pub async fn build_relay(
    transport: impl Transport,
    config: RelayConfig,
) -> Result<Relay, RelayError> {
    let relay = Relay::new(transport, config);
    relay.use_plugin(Health::new().plugin());
    relay.use_plugin(Math::plugin(MathOptions::default()));
    relay.ready().await?;
    Ok(relay)
}
