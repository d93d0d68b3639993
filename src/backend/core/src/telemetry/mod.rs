//! Telemetry: structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use permstack_core::config::Config;
//! use permstack_core::telemetry::init_telemetry;
//!
//! let config = Config::default();
//! let metrics = init_telemetry(&config.observability).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_with_format, LogFormat};
pub use metrics::{init_metrics, MetricsRegistry};

use crate::config::ObservabilityConfig;

/// Initialize logging and metrics together.
pub fn init_telemetry(config: &ObservabilityConfig) -> anyhow::Result<MetricsRegistry> {
    init_logging(config)?;
    init_metrics(config)
}
