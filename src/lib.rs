pub mod activations;
pub mod builder;
pub mod config;
pub mod plugin_system;
pub mod relay;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use builder::build_relay;
pub use config::RelayConfig;
pub use plugin_system::{Done, PluginDescriptor, PluginMeta, PluginState};
pub use relay::{BusinessError, Exchange, Relay, RelayError, Request, Stage};
pub use transport::{MemoryTransport, Transport};
pub use types::{IntoPattern, MaxMessages, Pattern};
