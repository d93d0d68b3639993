//! Prometheus metrics.
//!
//! Components record through the `metrics` facade macros using the names
//! below; [`init_metrics`] installs the Prometheus recorder that collects them.

use crate::config::ObservabilityConfig;
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const CACHE_HITS: &str = "permstack_cache_hits_total";
pub const CACHE_MISSES: &str = "permstack_cache_misses_total";
pub const CACHE_INVALIDATIONS: &str = "permstack_cache_invalidations_total";
pub const RESOLUTIONS: &str = "permstack_resolutions_total";
pub const RESOLUTION_DURATION: &str = "permstack_resolution_duration_seconds";
pub const STORAGE_OPERATIONS: &str = "permstack_storage_operations_total";
pub const INCONSISTENT_REFERENCES: &str = "permstack_inconsistent_references_total";
pub const MALFORMED_NODES: &str = "permstack_malformed_nodes_total";
pub const ERRORS: &str = "permstack_errors_total";

const DURATION_BUCKETS: &[f64] = &[
    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5,
];

/// Handle onto the installed recorder.
#[derive(Clone)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsRegistry {
    /// A registry with no recorder; [`render`](Self::render) yields nothing.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render the current metrics in Prometheus text format.
    pub fn render(&self) -> Option<String> {
        self.prometheus_handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Install the Prometheus recorder if metrics are enabled.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics(config: &ObservabilityConfig) -> anyhow::Result<MetricsRegistry> {
    if !config.metrics_enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)?
        .install_recorder()?;

    register_metric_descriptions();

    tracing::info!("Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(CACHE_HITS, "Cached resolution lookups served without recomputation");
    describe_counter!(CACHE_MISSES, "Cached resolution lookups that had to resolve");
    describe_counter!(CACHE_INVALIDATIONS, "Per-user cache invalidations");
    describe_counter!(RESOLUTIONS, "Resolutions computed by the engine");
    describe_histogram!(
        RESOLUTION_DURATION,
        Unit::Seconds,
        "Time spent walking the inheritance chain"
    );
    describe_counter!(STORAGE_OPERATIONS, "Storage operations by backing, operation and outcome");
    describe_counter!(MALFORMED_NODES, "Stored nodes skipped because they could not be decoded");
    describe_counter!(
        INCONSISTENT_REFERENCES,
        "References to groups or tracks that no longer exist"
    );
    describe_counter!(ERRORS, "Errors logged, by code");
}
