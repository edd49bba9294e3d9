//! Logging bootstrap.
//!
//! Components never own a logger; they log through `tracing` and receive the
//! span they should run in from whoever constructs them. This module only
//! installs the subscriber that renders those events.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{EngineConfig, Error, Result};

/// Install the global subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from `default_filter`.
/// Fails with [`Error::Internal`] if a subscriber is already installed.
pub fn init(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to install log subscriber: {e}")))
}

/// Install the global subscriber with the fallback filter of `config`.
pub fn init_from_config(config: &EngineConfig) -> Result<()> {
    init(&config.log_filter)
}

/// Install a subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call has an effect.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "cadence_audio=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
