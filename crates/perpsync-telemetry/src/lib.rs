//! Prometheus metrics and structured logging for perpsync.
//!
//! - Structured logging with tracing (JSON in production, pretty otherwise)
//! - Prometheus metrics for cache behaviour, coalescing, retries, scope phases
//!   and forwarded writes

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, init_logging_with_filter};
pub use metrics::Metrics;
