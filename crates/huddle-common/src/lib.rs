//! Shared utilities for Huddle: configuration, logging, error types, metrics.
//!
//! This crate provides common infrastructure used across all Huddle components.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod helpers;
pub mod metrics;

pub use config::Config;
pub use error::{Error, Result};
pub use metrics::{ErrorReason, Metrics, MetricsSnapshot};

/// Initialize tracing with a specific default level.
///
/// The `RUST_LOG` environment variable overrides `default_level` when set.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
