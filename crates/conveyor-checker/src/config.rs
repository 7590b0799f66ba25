//! Checker tunables.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// How often each pipeline's checkables are revisited.
    pub tick_interval: Duration,
    /// Check interval for checkables that do not set one.
    pub default_interval: Duration,
    /// Upper bound on a single check.
    pub timeout: Duration,
    /// Checks running at once across all pipelines.
    pub max_concurrent: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            default_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
            max_concurrent: 32,
        }
    }
}
