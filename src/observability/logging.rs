//! # Structured Logging
//!
//! Installs the global `tracing` subscriber for the service binary. Library code only
//! emits events through the `tracing` macros; embedding applications are free to wire
//! up their own subscriber instead of calling [`init_logging`].

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::error::{ServiceError, ServiceResult};
use crate::observability::config::{LogConfig, LogFormat};

/// Build the filter: `RUST_LOG` wins, otherwise the configured level
pub fn build_filter(config: &LogConfig) -> ServiceResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            ServiceError::observability(format!("Invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Initialize the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> ServiceResult<()> {
    let filter = build_filter(config)?;
    let registry = Registry::default().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(true))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(true))
            .try_init(),
    };

    result.map_err(|e| {
        ServiceError::observability(format!("Failed to initialize tracing subscriber: {}", e))
    })?;

    info!(level = %config.level, format = ?config.format, "Structured logging initialized");
    Ok(())
}
