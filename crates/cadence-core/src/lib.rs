//! # cadence-core
//!
//! Error handling, configuration, logging bootstrap and shared types for the
//! Cadence playback pipeline.

pub mod config;
pub mod error;
pub mod logging;
pub mod metadata;

pub use config::EngineConfig;
pub use error::{Error, ErrorCode, Result};
pub use metadata::TrackMetadata;
