//! perpsync daemon.
//!
//! Keeps the positions, margin account and orders of the configured users,
//! plus the order book, in sync with the view gateway:
//! - TOML configuration with per-resource poll intervals and cache windows
//! - Optional on-disk mirror of user snapshots
//! - Structured logging of every published view

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::{AppConfig, OperatingMode};
pub use error::{AppError, AppResult};
