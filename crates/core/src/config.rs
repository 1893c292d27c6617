use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime knobs for one informer. Passed explicitly to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformerConfig {
    /// Interval between resync ticks; zero disables resync.
    pub resync_period: Duration,
    /// Consecutive failed watch attempts tolerated before relisting.
    pub watch_retry_budget: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(30),
            watch_retry_budget: 5,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl InformerConfig {
    /// Defaults overridden by `MIRRA_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let resync_period = std::env::var("MIRRA_RESYNC_SECS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.resync_period);
        let watch_retry_budget = std::env::var("MIRRA_WATCH_RETRY_BUDGET").ok().and_then(|s| s.parse::<u32>().ok()).unwrap_or(d.watch_retry_budget);
        let backoff_initial = std::env::var("MIRRA_BACKOFF_INITIAL_MS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(d.backoff_initial);
        let backoff_max = std::env::var("MIRRA_WATCH_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.backoff_max);
        Self { resync_period, watch_retry_budget, backoff_initial, backoff_max }
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }
}
