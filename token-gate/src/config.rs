use std::time::Duration;

const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Policy parameters for a limiter.
///
/// Which fields matter depends on the constructor:
///
/// | Constructor | Required | Also honoured |
/// |---|---|---|
/// | [`Manager::max_concurrency`](crate::Manager::max_concurrency) | `limit` | `token_resets_after` |
/// | [`Manager::throttle`](crate::Manager::throttle) | `throttle` | `token_resets_after` |
/// | [`Manager::fixed_window`](crate::Manager::fixed_window) | `fixed_interval`, `limit` | `token_resets_after` |
///
/// Zero durations mean "unset".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// How many tokens may be active at once.
    pub limit: usize,
    /// Window length for the fixed window policy.
    pub fixed_interval: Duration,
    /// Minimum spacing between grants for the throttle policy.
    pub throttle: Duration,
    /// Maximum time a token may be held before it is forcefully released.
    /// Zero lets tokens live forever.
    pub token_resets_after: Duration,
    /// Capacity of the admission request queue feeding the coordinator.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limit: 0,
            fixed_interval: Duration::ZERO,
            throttle: Duration::ZERO,
            token_resets_after: Duration::ZERO,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl Config {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_fixed_interval(mut self, fixed_interval: Duration) -> Self {
        self.fixed_interval = fixed_interval;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_token_resets_after(mut self, token_resets_after: Duration) -> Self {
        self.token_resets_after = token_resets_after;
        self
    }

    /// Set the admission queue capacity. Values below 1 are treated as 1.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub(crate) fn effective_queue_depth(&self) -> usize {
        self.queue_depth.max(1)
    }
}
