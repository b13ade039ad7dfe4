//! Process-wide statistics for the cluster cache engine.
//!
//! Counters are registered once in a global registry; every engine
//! instance in the process increments the same counters, mirroring the
//! per-node statistics the operation naturally aggregates over.

use std::sync::OnceLock;

use prometheus::{Counter, Gauge, Registry, TextEncoder};

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Returns the process-wide metrics, initialising them on first use.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Cluster cache engine metrics.
pub struct Metrics {
    registry: Registry,

    // Remote operation metrics
    /// Remote operations started.
    pub remote_ops: Counter,
    /// Remote operations that hit their deadline.
    pub remote_op_timeouts: Counter,
    /// Replies that arrived after timeout or cancellation and were dropped.
    pub late_replies: Counter,
    /// Operations failed by peer death.
    pub peer_failures: Counter,

    // Responder metrics
    /// Responder operations currently outstanding.
    pub responder_ops_active: Gauge,
    /// Replies sent with the whole object inlined.
    pub inline_replies: Counter,

    // Data transfer metrics
    /// Object bytes sent in data frames.
    pub data_bytes_sent: Counter,
    /// Object bytes received in data frames.
    pub data_bytes_received: Counter,

    // Write-VC reuse cache metrics
    pub vc_cache_inserts: Counter,
    pub vc_cache_insert_lock_misses: Counter,
    pub vc_cache_lookup_hits: Counter,
    pub vc_cache_lookup_misses: Counter,
    pub vc_cache_lookup_lock_misses: Counter,
    pub vc_cache_scans: Counter,
    pub vc_cache_scan_lock_misses: Counter,
    pub vc_cache_purges: Counter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let remote_ops = Counter::new("cachelink_remote_ops_total", "Remote operations started")
            .expect("valid metric");
        let remote_op_timeouts = Counter::new(
            "cachelink_remote_op_timeouts_total",
            "Remote operations that hit their deadline",
        )
        .expect("valid metric");
        let late_replies = Counter::new(
            "cachelink_late_replies_total",
            "Replies dropped after timeout or cancellation",
        )
        .expect("valid metric");
        let peer_failures = Counter::new(
            "cachelink_peer_failures_total",
            "Operations failed by peer death",
        )
        .expect("valid metric");

        let responder_ops_active = Gauge::new(
            "cachelink_responder_ops_active",
            "Responder operations currently outstanding",
        )
        .expect("valid metric");
        let inline_replies = Counter::new(
            "cachelink_inline_replies_total",
            "Replies sent with the whole object inlined",
        )
        .expect("valid metric");

        let data_bytes_sent = Counter::new(
            "cachelink_data_bytes_sent_total",
            "Object bytes sent in data frames",
        )
        .expect("valid metric");
        let data_bytes_received = Counter::new(
            "cachelink_data_bytes_received_total",
            "Object bytes received in data frames",
        )
        .expect("valid metric");

        let vc_cache_inserts = Counter::new(
            "cachelink_vc_cache_inserts_total",
            "Write-VC reuse cache inserts",
        )
        .expect("valid metric");
        let vc_cache_insert_lock_misses = Counter::new(
            "cachelink_vc_cache_insert_lock_misses_total",
            "Reuse cache inserts deferred by lock contention",
        )
        .expect("valid metric");
        let vc_cache_lookup_hits = Counter::new(
            "cachelink_vc_cache_lookup_hits_total",
            "Reuse cache lookups that salvaged a VC",
        )
        .expect("valid metric");
        let vc_cache_lookup_misses = Counter::new(
            "cachelink_vc_cache_lookup_misses_total",
            "Reuse cache lookups that found nothing",
        )
        .expect("valid metric");
        let vc_cache_lookup_lock_misses = Counter::new(
            "cachelink_vc_cache_lookup_lock_misses_total",
            "Reuse cache lookups deferred by lock contention",
        )
        .expect("valid metric");
        let vc_cache_scans = Counter::new(
            "cachelink_vc_cache_scans_total",
            "Reuse cache purge scans",
        )
        .expect("valid metric");
        let vc_cache_scan_lock_misses = Counter::new(
            "cachelink_vc_cache_scan_lock_misses_total",
            "Purge scans deferred by lock contention",
        )
        .expect("valid metric");
        let vc_cache_purges = Counter::new(
            "cachelink_vc_cache_purges_total",
            "Reuse cache entries purged",
        )
        .expect("valid metric");

        for c in [
            &remote_ops,
            &remote_op_timeouts,
            &late_replies,
            &peer_failures,
            &inline_replies,
            &data_bytes_sent,
            &data_bytes_received,
            &vc_cache_inserts,
            &vc_cache_insert_lock_misses,
            &vc_cache_lookup_hits,
            &vc_cache_lookup_misses,
            &vc_cache_lookup_lock_misses,
            &vc_cache_scans,
            &vc_cache_scan_lock_misses,
            &vc_cache_purges,
        ] {
            registry
                .register(Box::new(c.clone()))
                .expect("unique metric");
        }
        registry
            .register(Box::new(responder_ops_active.clone()))
            .expect("unique metric");

        Self {
            registry,
            remote_ops,
            remote_op_timeouts,
            late_replies,
            peer_failures,
            responder_ops_active,
            inline_replies,
            data_bytes_sent,
            data_bytes_received,
            vc_cache_inserts,
            vc_cache_insert_lock_misses,
            vc_cache_lookup_hits,
            vc_cache_lookup_misses,
            vc_cache_lookup_lock_misses,
            vc_cache_scans,
            vc_cache_scan_lock_misses,
            vc_cache_purges,
        }
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}
