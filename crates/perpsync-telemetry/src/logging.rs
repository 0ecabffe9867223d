//! Structured logging initialization.

use crate::error::{TelemetryError, TelemetryResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default directive when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,perpsync=debug";

/// Initialize structured logging with the default filter.
///
/// `RUST_LOG` takes precedence. JSON output when `RUST_ENV=production`,
/// pretty output otherwise.
pub fn init_logging() -> TelemetryResult<()> {
    init_logging_with_filter(DEFAULT_FILTER)
}

/// Initialize structured logging with a fallback filter directive
/// (used when `RUST_LOG` is not set).
pub fn init_logging_with_filter(fallback: &str) -> TelemetryResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let is_production = std::env::var("RUST_ENV")
        .map(|v| v == "production")
        .unwrap_or(false);

    let result = if is_production {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(true))
            .try_init()
    };

    result.map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}
