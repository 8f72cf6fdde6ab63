use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on step executions in flight within one run.
    pub max_concurrent_steps: usize,
    /// Deadline for nodes that do not set their own `timeout_ms`.
    pub default_step_timeout_ms: u64,
    /// How long cancelled steps get to stop before they are aborted.
    pub cancel_grace_ms: u64,
    /// Capacity of the broadcast channels carrying run events.
    pub event_buffer_size: usize,
}

impl RuntimeConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 10,
            default_step_timeout_ms: 300_000,
            cancel_grace_ms: 5_000,
            event_buffer_size: 1000,
        }
    }
}
