//! Headless backend whose device callback is driven by the caller.
//!
//! [`ManualDevice::request`] plays the part of the real-time thread asking
//! for bytes, and [`ManualDevice::play`] advances what the "hardware" has
//! consumed. Useful for tests and for rendering a track to memory.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cadence_core::{Error, Result};
use parking_lot::Mutex;
use tracing::debug;

use super::{
    AudioBackend, CallbackSlot, OutputStream, StreamState, TimingInfo, Volume, WriteCallback,
};
use crate::format::{SampleFormat, StreamFormat};

struct Counters {
    write_index: u64,
    read_index: u64,
    reported: bool,
}

struct StreamShared {
    format: StreamFormat,
    name: String,
    slot: Mutex<CallbackSlot>,
    counters: Mutex<Counters>,
    volume: AtomicU32,
    state: Mutex<StreamState>,
}

#[derive(Default)]
struct DeviceInner {
    current: Option<Arc<StreamShared>>,
    streams_opened: usize,
}

/// Caller-side handle to the device of a [`ManualBackend`].
#[derive(Clone, Default)]
pub struct ManualDevice {
    inner: Arc<Mutex<DeviceInner>>,
}

impl ManualDevice {
    fn current(&self) -> Option<Arc<StreamShared>> {
        self.inner.lock().current.clone()
    }

    /// Ask the open stream for `len` bytes, as a device callback would.
    ///
    /// Returns silence while corked and an empty vector when no stream is open.
    pub fn request(&self, len: usize) -> Vec<u8> {
        let Some(stream) = self.current() else {
            return Vec::new();
        };

        let mut out = vec![0u8; len];
        let played = stream
            .slot
            .lock()
            .render(&mut out, stream.format.sample_format().silence_byte());
        if played {
            let mut counters = stream.counters.lock();
            counters.write_index += len as u64;
            counters.reported = true;
        }
        out
    }

    /// Mark `len` more written bytes as played by the hardware.
    pub fn play(&self, len: u64) {
        if let Some(stream) = self.current() {
            let mut counters = stream.counters.lock();
            counters.read_index = (counters.read_index + len).min(counters.write_index);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    /// Whether the open stream is corked. `true` when no stream is open.
    pub fn is_corked(&self) -> bool {
        self.current().map_or(true, |s| s.slot.lock().is_corked())
    }

    pub fn volume(&self) -> Option<Volume> {
        self.current()
            .map(|s| Volume(s.volume.load(Ordering::Relaxed)))
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.current().map(|s| s.format)
    }

    pub fn stream_name(&self) -> Option<String> {
        self.current().map(|s| s.name.clone())
    }

    pub fn timing(&self) -> Option<TimingInfo> {
        self.current().and_then(|s| timing_of(&s))
    }

    /// Simulate a device-side state change such as a disconnect.
    pub fn set_state(&self, state: StreamState) {
        if let Some(stream) = self.current() {
            *stream.state.lock() = state;
        }
    }

    /// Number of streams opened so far.
    pub fn streams_opened(&self) -> usize {
        self.inner.lock().streams_opened
    }
}

fn timing_of(stream: &StreamShared) -> Option<TimingInfo> {
    let counters = stream.counters.lock();
    counters.reported.then_some(TimingInfo {
        write_index: counters.write_index,
        read_index: counters.read_index,
    })
}

/// Backend driven explicitly through a [`ManualDevice`].
#[derive(Default)]
pub struct ManualBackend {
    device: ManualDevice,
    supported: Option<Vec<SampleFormat>>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the sample formats this backend accepts.
    pub fn with_supported_formats(mut self, formats: Vec<SampleFormat>) -> Self {
        self.supported = Some(formats);
        self
    }

    pub fn device(&self) -> ManualDevice {
        self.device.clone()
    }
}

impl AudioBackend for ManualBackend {
    fn check_format(&self, format: &StreamFormat) -> Result<()> {
        match &self.supported {
            Some(formats) if !formats.contains(&format.sample_format()) => Err(
                Error::invalid_format(format!("Device cannot play {}", format.sample_format())),
            ),
            _ => Ok(()),
        }
    }

    fn open_stream(
        &mut self,
        format: StreamFormat,
        name: &str,
        callback: WriteCallback,
    ) -> Result<Box<dyn OutputStream>> {
        self.check_format(&format)?;

        let shared = Arc::new(StreamShared {
            format,
            name: name.to_string(),
            slot: Mutex::new(CallbackSlot::new(callback)),
            counters: Mutex::new(Counters {
                write_index: 0,
                read_index: 0,
                reported: false,
            }),
            volume: AtomicU32::new(Volume::NORM.0),
            state: Mutex::new(StreamState::Ready),
        });

        {
            let mut inner = self.device.inner.lock();
            inner.current = Some(shared.clone());
            inner.streams_opened += 1;
        }
        debug!("Opened manual stream '{}' ({})", name, format);

        Ok(Box::new(ManualStream {
            shared,
            device: self.device.clone(),
        }))
    }
}

struct ManualStream {
    shared: Arc<StreamShared>,
    device: ManualDevice,
}

impl OutputStream for ManualStream {
    fn set_corked(&mut self, corked: bool) -> Result<()> {
        self.shared.slot.lock().set_corked(corked);
        Ok(())
    }

    fn is_corked(&self) -> bool {
        self.shared.slot.lock().is_corked()
    }

    fn flush(&mut self) -> Result<()> {
        let mut counters = self.shared.counters.lock();
        counters.read_index = counters.write_index;
        Ok(())
    }

    fn timing(&self) -> Option<TimingInfo> {
        timing_of(&self.shared)
    }

    fn set_volume(&mut self, volume: Volume) -> Result<()> {
        self.shared.volume.store(volume.0, Ordering::Relaxed);
        Ok(())
    }

    fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        *self.shared.state.lock() = StreamState::Terminated;
        let mut inner = self.device.inner.lock();
        if inner
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.shared))
        {
            inner.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::CallbackAction;

    fn open(backend: &mut ManualBackend) -> Box<dyn OutputStream> {
        let format = StreamFormat::new(2, SampleFormat::S16Le, 44_100).unwrap();
        backend
            .open_stream(
                format,
                "test",
                Box::new(|out: &mut [u8]| {
                    out.fill(1);
                    CallbackAction::Continue
                }),
            )
            .unwrap()
    }

    #[test]
    fn test_corked_stream_reports_no_timing() {
        let mut backend = ManualBackend::new();
        let device = backend.device();
        let stream = open(&mut backend);

        assert!(stream.is_corked());
        assert_eq!(device.request(8), vec![0; 8]);
        assert_eq!(stream.timing(), None);
        assert_eq!(device.stream_name().as_deref(), Some("test"));
    }

    #[test]
    fn test_counters_follow_requests_and_playback() {
        let mut backend = ManualBackend::new();
        let device = backend.device();
        let mut stream = open(&mut backend);

        stream.set_corked(false).unwrap();
        assert_eq!(device.request(16), vec![1; 16]);
        device.play(6);
        assert_eq!(
            stream.timing(),
            Some(TimingInfo {
                write_index: 16,
                read_index: 6
            })
        );

        stream.flush().unwrap();
        assert_eq!(stream.timing().unwrap().queued_bytes(), 0);
    }

    #[test]
    fn test_drop_closes_device_side() {
        let mut backend = ManualBackend::new();
        let device = backend.device();
        let stream = open(&mut backend);
        assert!(device.is_open());

        drop(stream);
        assert!(!device.is_open());
        assert!(device.request(4).is_empty());
        assert_eq!(device.streams_opened(), 1);
    }

    #[test]
    fn test_restricted_formats() {
        let backend = ManualBackend::new().with_supported_formats(vec![SampleFormat::S16Le]);
        let u8_mono = StreamFormat::new(1, SampleFormat::U8, 8_000).unwrap();
        assert!(matches!(backend.check_format(&u8_mono), Err(Error::InvalidFormat(_))));
    }
}
