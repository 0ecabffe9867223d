//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sync error: {0}")]
    Sync(#[from] perpsync_core::SyncError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] perpsync_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
