//! Engine tunables.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often a running build re-reads its persisted abort flag.
    pub abort_poll_interval: Duration,
    /// Buffered output lines per running process.
    pub output_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            abort_poll_interval: Duration::from_secs(2),
            output_buffer: 256,
        }
    }
}
