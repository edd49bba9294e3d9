//! Sample and stream format negotiation.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::fmt;

use cadence_core::{Error, Result};

use crate::wav::WavFormat;

pub const MAX_CHANNELS: u16 = 32;
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Interleaved sample encodings the pipeline can pass through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16Le,
    S24Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    /// Map a container's declared encoding and bit depth.
    pub fn from_wav(format: WavFormat, bit_depth: u16) -> Result<Self> {
        match (format, bit_depth) {
            (WavFormat::Pcm, 8) => Ok(Self::U8),
            (WavFormat::Pcm, 16) => Ok(Self::S16Le),
            (WavFormat::Pcm, 24) => Ok(Self::S24Le),
            (WavFormat::Pcm, 32) => Ok(Self::S32Le),
            (WavFormat::IeeeFloat, 32) => Ok(Self::F32Le),
            _ => Err(Error::invalid_format(format!(
                "Unsupported sample encoding {format:?} at {bit_depth} bits"
            ))),
        }
    }

    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16Le => 2,
            Self::S24Le => 3,
            Self::S32Le | Self::F32Le => 4,
        }
    }

    /// Byte value that encodes silence. Unsigned 8-bit audio is centred on 0x80.
    pub const fn silence_byte(self) -> u8 {
        match self {
            Self::U8 => 0x80,
            _ => 0,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "u8",
            Self::S16Le => "s16le",
            Self::S24Le => "s24le",
            Self::S32Le => "s32le",
            Self::F32Le => "f32le",
        };
        f.write_str(name)
    }
}

/// Device format of one loaded track. Immutable for the track's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    channels: u16,
    sample_format: SampleFormat,
    sample_rate: u32,
}

impl StreamFormat {
    pub fn new(channels: u16, sample_format: SampleFormat, sample_rate: u32) -> Result<Self> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(Error::invalid_format(format!(
                "Unsupported channel count {channels}"
            )));
        }
        if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
            return Err(Error::invalid_format(format!(
                "Unsupported sample rate {sample_rate}"
            )));
        }
        Ok(Self {
            channels,
            sample_format,
            sample_rate,
        })
    }

    pub const fn channels(&self) -> u16 {
        self.channels
    }

    pub const fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Bytes in one frame (one sample per channel).
    pub const fn frame_size(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }

    pub const fn bytes_per_second(&self) -> u64 {
        self.frame_size() as u64 * self.sample_rate as u64
    }

    /// Frame index at a position in seconds, rounded down. Negative positions map to 0.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn frame_index_at(&self, seconds: f64) -> u64 {
        if !seconds.is_finite() || seconds <= 0.0 {
            return 0;
        }
        (seconds * f64::from(self.sample_rate)).floor() as u64
    }

    /// Frame-aligned byte offset at a position in seconds.
    pub fn byte_offset_at(&self, seconds: f64) -> u64 {
        self.frame_index_at(seconds) * self.frame_size() as u64
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn bytes_to_seconds(&self, bytes: u64) -> f64 {
        bytes as f64 / self.bytes_per_second() as f64
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}ch {}Hz",
            self.sample_format, self.channels, self.sample_rate
        )
    }
}
