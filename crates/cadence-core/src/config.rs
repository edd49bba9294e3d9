//! Engine configuration.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Smallest accepted ring buffer capacity in bytes.
///
/// Must exceed the largest legal frame (32 channels of 4-byte samples).
pub const MIN_BUFFER_CAPACITY: usize = 256;

/// Default ring buffer capacity: about 0.75s of 44.1kHz 16-bit stereo.
pub const DEFAULT_BUFFER_CAPACITY: usize = 128 * 1024;

/// Tunables for the playback engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Ring buffer capacity in bytes.
    pub buffer_capacity: usize,
    /// Volume applied to every newly opened stream (0.0 to 1.0).
    pub initial_volume: f32,
    /// Name given to the device stream.
    pub stream_name: String,
    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            initial_volume: 1.0,
            stream_name: "Playback".to_string(),
            log_filter: "cadence_core=info,cadence_audio=info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(Error::Config(format!(
                "buffer_capacity must be at least {MIN_BUFFER_CAPACITY} bytes, got {}",
                self.buffer_capacity
            )));
        }
        if !self.initial_volume.is_finite() {
            return Err(Error::Config("initial_volume must be finite".to_string()));
        }
        Ok(())
    }

    /// Builder-style override of the buffer capacity.
    pub const fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}
