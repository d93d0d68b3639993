//! Structured logging with JSON or compact output.

use crate::config::ObservabilityConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    Json,
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output
    Compact,
}

impl LogFormat {
    pub fn from_config(config: &ObservabilityConfig) -> Self {
        if config.json_logging {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }
}

/// Build the filter from `RUST_LOG` if set, otherwise from the configured level.
fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(level)?),
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed or the level directive is invalid.
pub fn init_logging(config: &ObservabilityConfig) -> anyhow::Result<()> {
    init_logging_with_format(config, LogFormat::from_config(config))
}

/// Install the global tracing subscriber with an explicit format.
pub fn init_logging_with_format(config: &ObservabilityConfig, format: LogFormat) -> anyhow::Result<()> {
    let filter = build_filter(&config.log_level)?;

    match format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer().json().with_target(true).with_current_span(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer().pretty().with_target(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer().compact().with_target(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    tracing::debug!(level = %config.log_level, ?format, "Logging initialized");
    Ok(())
}
