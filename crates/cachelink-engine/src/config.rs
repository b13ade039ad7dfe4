//! Engine configuration.

use std::time::Duration;

/// Configuration for a cluster cache engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Convert a failed remote open-read into a remote open-write on the
    /// first probe instead of multi-hop probing.
    pub migrate_on_demand: bool,
    /// Upper bound on successor-node probing when the owner is down.
    /// Accepted for configuration compatibility; successor probing is not
    /// performed by this engine.
    pub probe_depth_max: u32,
    /// Default per-operation deadline.
    pub cluster_timeout: Duration,
    /// Back-off applied after a striped-lock miss before retrying.
    pub retry_period: Duration,
    /// Interval between reuse-cache purge scans.
    pub scan_interval: Duration,
    /// Objects strictly smaller than this are inlined in the open-read
    /// reply; anything at or above it streams.
    pub small_fragment_threshold: u64,
    /// Upper bound advertised to the responder for data inlined in a
    /// reply.
    pub reply_buffer_hint: u32,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables read-miss to write salvage.
    pub fn with_migrate_on_demand(mut self, enabled: bool) -> Self {
        self.migrate_on_demand = enabled;
        self
    }

    /// Sets the probing depth bound.
    pub fn with_probe_depth_max(mut self, depth: u32) -> Self {
        self.probe_depth_max = depth;
        self
    }

    /// Sets the default per-operation deadline.
    pub fn with_cluster_timeout(mut self, timeout: Duration) -> Self {
        self.cluster_timeout = timeout;
        self
    }

    /// Sets the lock-miss retry back-off.
    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period;
        self
    }

    /// Sets the reuse-cache purge interval.
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Sets the small-object inlining threshold.
    pub fn with_small_fragment_threshold(mut self, bytes: u64) -> Self {
        self.small_fragment_threshold = bytes;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            migrate_on_demand: false,
            probe_depth_max: 0,
            cluster_timeout: Duration::from_secs(5),
            retry_period: Duration::from_millis(10),
            scan_interval: Duration::from_secs(10),
            small_fragment_threshold: 4096,
            reply_buffer_hint: 64 * 1024,
        }
    }
}
