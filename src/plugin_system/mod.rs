pub mod supervisor;
pub mod types;

pub use supervisor::BootSupervisor;
pub use types::{Done, PluginDescriptor, PluginFn, PluginMeta, PluginState};
