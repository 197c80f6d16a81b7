mod activation;
mod types;

pub use activation::Health;
pub use types::HealthEvent;
