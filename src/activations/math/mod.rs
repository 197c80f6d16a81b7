mod activation;
mod types;

pub use activation::Math;
pub use types::MathOptions;
