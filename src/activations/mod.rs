// Services bundled with the relay binary. Each one installs itself through
// the plugin supervisor.

pub mod health;
pub mod math;
