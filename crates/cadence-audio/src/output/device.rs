//! Audio output using cpal.
//!
//! Streams carry the track's own sample format as raw bytes. A `cpal::Stream`
//! is not `Send`, so each one lives on a dedicated `audio-output` thread that
//! takes play/pause/close commands over a channel.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cadence_core::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    AudioBackend, CallbackSlot, OutputStream, StreamState, TimingInfo, Volume, WriteCallback,
};
use crate::format::{SampleFormat, StreamFormat};

/// Commands for the thread owning a cpal stream.
#[derive(Debug, Clone, Copy)]
enum StreamCommand {
    Play,
    Pause,
    Close,
}

/// Backend for the system's audio devices.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    device_name: Option<String>,
}

impl CpalBackend {
    /// Use the host's default output device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the output device with this name.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

/// Names of the available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::Internal(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// Name of the default output device, if there is one.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    host.default_output_device().and_then(|d| d.name().ok())
}

fn find_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| Error::internal("No output device found")),
        Some(name) => host
            .output_devices()
            .map_err(|e| Error::Internal(format!("Failed to list devices: {e}")))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| Error::Internal(format!("Output device '{name}' not found"))),
    }
}

/// cpal sample type carrying `format` byte for byte, if there is one.
///
/// cpal buffers are native-endian, so little-endian formats only pass through
/// unchanged on little-endian hosts. Packed 24-bit has no cpal equivalent.
const fn cpal_sample_format(format: SampleFormat) -> Option<cpal::SampleFormat> {
    if cfg!(target_endian = "big") {
        return None;
    }
    match format {
        SampleFormat::U8 => Some(cpal::SampleFormat::U8),
        SampleFormat::S16Le => Some(cpal::SampleFormat::I16),
        SampleFormat::S32Le => Some(cpal::SampleFormat::I32),
        SampleFormat::F32Le => Some(cpal::SampleFormat::F32),
        SampleFormat::S24Le => None,
    }
}

fn require_cpal_format(format: &StreamFormat) -> Result<cpal::SampleFormat> {
    cpal_sample_format(format.sample_format()).ok_or_else(|| {
        Error::invalid_format(format!(
            "Output device cannot play {} samples",
            format.sample_format()
        ))
    })
}

impl AudioBackend for CpalBackend {
    fn check_format(&self, format: &StreamFormat) -> Result<()> {
        require_cpal_format(format).map(|_| ())
    }

    fn open_stream(
        &mut self,
        format: StreamFormat,
        name: &str,
        callback: WriteCallback,
    ) -> Result<Box<dyn OutputStream>> {
        let sample_format = require_cpal_format(&format)?;

        let shared = Arc::new(CpalShared {
            format,
            slot: Mutex::new(CallbackSlot::new(callback)),
            timing: Mutex::new(DeviceTiming::default()),
            volume: AtomicU32::new(Volume::NORM.0),
            state: Mutex::new(StreamState::Ready),
        });

        let (ready_tx, ready_rx) = bounded::<Result<String>>(1);
        let (command_tx, command_rx) = unbounded();
        let thread_shared = shared.clone();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let opened = find_device(device_name.as_deref()).and_then(|device| {
                    let stream = build_stream(&device, format, sample_format, thread_shared.clone())?;
                    Ok((stream, device.name().unwrap_or_else(|_| "Unknown".to_string())))
                });
                match opened {
                    Ok((stream, device_name)) => {
                        let _ = ready_tx.send(Ok(device_name));
                        run_stream(&stream, &command_rx, &thread_shared);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn audio output thread: {e}")))?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| Error::internal("Audio output thread exited during setup"))??;
        info!("Opened stream '{}' on {}: {}", name, device_name, format);

        Ok(Box::new(CpalStream {
            shared,
            commands: command_tx,
            thread: Some(thread),
        }))
    }
}

fn build_stream(
    device: &cpal::Device,
    format: StreamFormat,
    sample_format: cpal::SampleFormat,
    shared: Arc<CpalShared>,
) -> Result<cpal::Stream> {
    let config = cpal::StreamConfig {
        channels: format.channels(),
        sample_rate: cpal::SampleRate(format.sample_rate()),
        buffer_size: cpal::BufferSize::Default,
    };
    let error_shared = shared.clone();

    device
        .build_output_stream_raw(
            &config,
            sample_format,
            move |data: &mut cpal::Data, info: &cpal::OutputCallbackInfo| {
                shared.fill(data.bytes_mut(), info);
            },
            move |err| {
                error!("Audio stream error: {err}");
                *error_shared.state.lock() = StreamState::Failed;
            },
            None,
        )
        .map_err(|e| Error::Internal(format!("Failed to build stream: {e}")))
}

fn run_stream(stream: &cpal::Stream, commands: &Receiver<StreamCommand>, shared: &CpalShared) {
    // Built streams may start on their own; keep the device quiet until uncorked.
    let _ = stream.pause();

    for command in commands {
        let result = match command {
            StreamCommand::Play => stream.play().map_err(|e| e.to_string()),
            StreamCommand::Pause => stream.pause().map_err(|e| e.to_string()),
            StreamCommand::Close => break,
        };
        if let Err(e) = result {
            warn!("Stream command {:?} failed: {e}", command);
            if matches!(command, StreamCommand::Play) {
                *shared.state.lock() = StreamState::Failed;
            }
        }
    }
    debug!("Audio output thread exiting");
}

#[derive(Debug, Default)]
struct DeviceTiming {
    write_index: u64,
    /// Bytes handed over but not yet audible, as estimated by the last callback.
    queued: u64,
    reported: bool,
}

struct CpalShared {
    format: StreamFormat,
    slot: Mutex<CallbackSlot>,
    timing: Mutex<DeviceTiming>,
    volume: AtomicU32,
    state: Mutex<StreamState>,
}

impl CpalShared {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn fill(&self, out: &mut [u8], info: &cpal::OutputCallbackInfo) {
        let sample_format = self.format.sample_format();
        if !self.slot.lock().render(out, sample_format.silence_byte()) {
            return;
        }
        apply_gain(sample_format, Volume(self.volume.load(Ordering::Relaxed)), out);

        let timestamp = info.timestamp();
        let latency = timestamp
            .playback
            .duration_since(&timestamp.callback)
            .unwrap_or_default();
        let latency_bytes =
            (latency.as_secs_f64() * self.format.bytes_per_second() as f64) as u64;

        let mut timing = self.timing.lock();
        timing.write_index += out.len() as u64;
        timing.queued = out.len() as u64 + latency_bytes;
        timing.reported = true;
    }
}

struct CpalStream {
    shared: Arc<CpalShared>,
    commands: Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn send(&self, command: StreamCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|e| Error::Internal(format!("Audio output thread is gone: {e}")))
    }
}

impl OutputStream for CpalStream {
    fn set_corked(&mut self, corked: bool) -> Result<()> {
        self.shared.slot.lock().set_corked(corked);
        self.send(if corked {
            StreamCommand::Pause
        } else {
            StreamCommand::Play
        })
    }

    fn is_corked(&self) -> bool {
        self.shared.slot.lock().is_corked()
    }

    fn flush(&mut self) -> Result<()> {
        self.shared.timing.lock().queued = 0;
        Ok(())
    }

    fn timing(&self) -> Option<TimingInfo> {
        let timing = self.shared.timing.lock();
        timing.reported.then(|| TimingInfo {
            write_index: timing.write_index,
            read_index: timing.write_index.saturating_sub(timing.queued),
        })
    }

    fn set_volume(&mut self, volume: Volume) -> Result<()> {
        self.shared.volume.store(volume.0, Ordering::Relaxed);
        Ok(())
    }

    fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.commands.send(StreamCommand::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Audio output thread panicked");
            }
        }
        *self.shared.state.lock() = StreamState::Terminated;
    }
}

/// Scale interleaved samples in place. Unity gain leaves the bytes untouched.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn apply_gain(format: SampleFormat, volume: Volume, bytes: &mut [u8]) {
    if volume >= Volume::NORM {
        return;
    }
    let gain = f64::from(volume.0) / f64::from(Volume::NORM.0);

    match format {
        SampleFormat::U8 => {
            for sample in bytes.iter_mut() {
                let centred = f64::from(*sample) - 128.0;
                *sample = (centred * gain + 128.0).round() as u8;
            }
        }
        SampleFormat::S16Le => {
            for chunk in bytes.chunks_exact_mut(2) {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                let scaled = (f64::from(sample) * gain).round() as i16;
                chunk.copy_from_slice(&scaled.to_le_bytes());
            }
        }
        SampleFormat::S24Le => {
            for chunk in bytes.chunks_exact_mut(3) {
                let sample = i32::from_le_bytes([0, chunk[0], chunk[1], chunk[2]]) >> 8;
                let scaled = (f64::from(sample) * gain).round() as i32;
                chunk.copy_from_slice(&scaled.to_le_bytes()[..3]);
            }
        }
        SampleFormat::S32Le => {
            for chunk in bytes.chunks_exact_mut(4) {
                let sample = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let scaled = (f64::from(sample) * gain).round() as i32;
                chunk.copy_from_slice(&scaled.to_le_bytes());
            }
        }
        SampleFormat::F32Le => {
            for chunk in bytes.chunks_exact_mut(4) {
                let sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let scaled = (f64::from(sample) * gain) as f32;
                chunk.copy_from_slice(&scaled.to_le_bytes());
            }
        }
    }
}
