use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::identity::Phase;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

/// How a request's mirror was obtained.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheStatus {
    /// Served as-is, no mutation.
    Hot,
    /// Fetched before serving.
    Refreshed,
    /// Cloned before serving.
    Cold,
    /// Refresh failed; the previous mirror was served.
    Stale,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheStatusLabels {
    pub status: CacheStatus,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SyncOperation {
    Clone,
    Fetch,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub operation: SyncOperation,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: SyncOperation,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum PhaseLabel {
    Advertise,
    Negotiate,
}

impl From<Phase> for PhaseLabel {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Advertise => Self::Advertise,
            Phase::Negotiate => Self::Negotiate,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: PhaseLabel,
}

impl PhaseLabels {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase: phase.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- requests --
    pub requests_total: Family<PhaseLabels, Counter>,
    pub cache_status_total: Family<CacheStatusLabels, Counter>,

    // -- mirror sync --
    pub mirror_sync_total: Family<SyncLabels, Counter>,
    pub mirror_sync_duration_seconds: Family<OperationLabels, Histogram>,

    // -- locks --
    pub lock_coalesced: Counter,

    // -- upload-pack --
    pub upload_pack_failures: Family<PhaseLabels, Counter>,
    pub active_sessions: Family<PhaseLabels, Gauge>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "gitcache_requests",
            "Accepted smart-HTTP requests by protocol phase",
            requests_total.clone(),
        );

        let cache_status_total = Family::<CacheStatusLabels, Counter>::default();
        registry.register(
            "gitcache_cache_status",
            "Requests by how their mirror was obtained",
            cache_status_total.clone(),
        );

        let mirror_sync_total = Family::<SyncLabels, Counter>::default();
        registry.register(
            "gitcache_mirror_sync",
            "Mirror clones and fetches by outcome",
            mirror_sync_total.clone(),
        );

        let mirror_sync_duration_seconds =
            Family::<OperationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.1, 2.0, 14))
            });
        registry.register(
            "gitcache_mirror_sync_duration_seconds",
            "Mirror clone and fetch latency in seconds",
            mirror_sync_duration_seconds.clone(),
        );

        let lock_coalesced = Counter::default();
        registry.register(
            "gitcache_lock_coalesced",
            "Requests that joined an in-flight mirror operation",
            lock_coalesced.clone(),
        );

        let upload_pack_failures = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "gitcache_upload_pack_failures",
            "upload-pack sessions that failed to start or exited non-zero",
            upload_pack_failures.clone(),
        );

        let active_sessions = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "gitcache_active_sessions",
            "upload-pack sessions currently streaming",
            active_sessions.clone(),
        );

        Self {
            requests_total,
            cache_status_total,
            mirror_sync_total,
            mirror_sync_duration_seconds,
            lock_coalesced,
            upload_pack_failures,
            active_sessions,
        }
    }

    /// Record the outcome and latency of one clone or fetch.
    pub fn record_sync(&self, operation: SyncOperation, result: &str, elapsed: Duration) {
        self.mirror_sync_total
            .get_or_create(&SyncLabels {
                operation,
                result: result.to_string(),
            })
            .inc();
        self.mirror_sync_duration_seconds
            .get_or_create(&OperationLabels { operation })
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_cache_status(&self, status: CacheStatus) {
        self.cache_status_total
            .get_or_create(&CacheStatusLabels { status })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
