//! Audio backend collaborator.
//!
//! A backend negotiates a [`StreamFormat`] and opens an [`OutputStream`]
//! that pulls bytes through a [`WriteCallback`] on a thread this crate does
//! not control. Streams open corked.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

pub mod device;
pub mod manual;

pub use device::CpalBackend;
pub use manual::{ManualBackend, ManualDevice};

use cadence_core::Result;

use crate::format::StreamFormat;

/// What the backend should do after a write callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    /// Cork the stream; no further callbacks until it is uncorked.
    Cork,
}

/// Fills the device buffer. Runs on the backend's real-time thread and must not block.
pub type WriteCallback = Box<dyn FnMut(&mut [u8]) -> CallbackAction + Send>;

/// Lifecycle reported by an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Ready,
    Failed,
    Terminated,
}

/// Byte counters of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingInfo {
    /// Bytes handed to the device by the write callback.
    pub write_index: u64,
    /// Bytes the device has actually played.
    pub read_index: u64,
}

impl TimingInfo {
    /// Bytes written but not yet played.
    pub const fn queued_bytes(&self) -> u64 {
        self.write_index.saturating_sub(self.read_index)
    }
}

/// Sink volume in the device's native unit, where [`Volume::NORM`] is unity gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Volume(pub u32);

impl Volume {
    pub const MUTED: Self = Self(0);
    pub const NORM: Self = Self(0x10000);

    /// Map a linear volume, clamped to `[0, 1]`. NaN is treated as muted.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_linear(volume: f32) -> Self {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        Self((f64::from(Self::NORM.0) * f64::from(volume)).round() as u32)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn to_linear(self) -> f32 {
        (f64::from(self.0) / f64::from(Self::NORM.0)) as f32
    }
}

/// Opens device streams.
pub trait AudioBackend: Send + Sync {
    /// Reject formats the backend cannot play, before any stream exists.
    fn check_format(&self, format: &StreamFormat) -> Result<()>;

    /// Open a corked stream that pulls bytes through `callback`.
    fn open_stream(
        &mut self,
        format: StreamFormat,
        name: &str,
        callback: WriteCallback,
    ) -> Result<Box<dyn OutputStream>>;
}

/// An open device stream.
pub trait OutputStream: Send + Sync {
    /// Cork or uncork. When this returns no callback is running.
    fn set_corked(&mut self, corked: bool) -> Result<()>;

    fn is_corked(&self) -> bool;

    /// Discard bytes the device is still holding.
    fn flush(&mut self) -> Result<()>;

    /// `None` until the device has reported any timing.
    fn timing(&self) -> Option<TimingInfo>;

    fn set_volume(&mut self, volume: Volume) -> Result<()>;

    fn state(&self) -> StreamState;
}

/// The write callback together with its cork flag.
///
/// Backends hold this behind a mutex so corking is synchronous with respect
/// to the device thread.
pub(crate) struct CallbackSlot {
    callback: WriteCallback,
    corked: bool,
}

impl CallbackSlot {
    pub(crate) fn new(callback: WriteCallback) -> Self {
        Self {
            callback,
            corked: true,
        }
    }

    pub(crate) const fn is_corked(&self) -> bool {
        self.corked
    }

    pub(crate) fn set_corked(&mut self, corked: bool) {
        self.corked = corked;
    }

    /// Fill `out` through the callback, or with `silence` while corked.
    ///
    /// Returns whether the callback produced the bytes.
    pub(crate) fn render(&mut self, out: &mut [u8], silence: u8) -> bool {
        if self.corked {
            out.fill(silence);
            return false;
        }
        if (self.callback)(out) == CallbackAction::Cork {
            self.corked = true;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_mapping() {
        assert_eq!(Volume::from_linear(1.0), Volume::NORM);
        assert_eq!(Volume::from_linear(0.5), Volume(0x8000));
        assert_eq!(Volume::from_linear(1.7), Volume::NORM);
        assert_eq!(Volume::from_linear(-0.3), Volume::MUTED);
        assert_eq!(Volume::from_linear(f32::NAN), Volume::MUTED);
        assert!((Volume(0x4000).to_linear() - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_queued_bytes_saturates() {
        let timing = TimingInfo {
            write_index: 10,
            read_index: 25,
        };
        assert_eq!(timing.queued_bytes(), 0);
    }

    #[test]
    fn test_slot_silence_while_corked_and_self_cork() {
        let mut calls = 0;
        let mut slot = CallbackSlot::new(Box::new(move |out: &mut [u8]| {
            calls += 1;
            out.fill(7);
            if calls == 2 {
                CallbackAction::Cork
            } else {
                CallbackAction::Continue
            }
        }));

        let mut out = [1u8; 4];
        assert!(!slot.render(&mut out, 0x80));
        assert_eq!(out, [0x80; 4]);

        slot.set_corked(false);
        assert!(slot.render(&mut out, 0));
        assert!(!slot.is_corked());
        assert!(slot.render(&mut out, 0));
        assert_eq!(out, [7; 4]);
        assert!(slot.is_corked());
    }
}
