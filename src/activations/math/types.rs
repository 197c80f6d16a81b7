use serde::{Deserialize, Serialize};

/// Plugin options of the math service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MathOptions {
    /// Upper bound accepted by `cmd: count`
    pub max_count: u64,
}

impl Default for MathOptions {
    fn default() -> Self {
        Self { max_count: 1_000 }
    }
}
