//! Structured logging infrastructure for the identity broker.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{CoreError, CoreResult};

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use sovereign_core::logging;
///
/// logging::init();
/// tracing::info!("Broker started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// This format is suitable for log aggregation systems and for building
/// compliance narratives out of issuance and denial events.
///
/// # Example
/// ```no_run
/// use sovereign_core::logging;
///
/// logging::init_json();
/// tracing::info!(service = "identity-broker", "Service started");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize logging from the `[logging]` config section.
///
/// `RUST_LOG` still wins over `config.level`. Unlike [`init`], a second call
/// returns an error instead of panicking.
pub fn init_from_config(config: &LoggingConfig) -> CoreResult<()> {
    let registry = tracing_subscriber::registry().with(env_filter(&config.level));
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
    };
    result.map_err(|e| CoreError::Logging(e.to_string()))
}

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}
