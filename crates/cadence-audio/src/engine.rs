//! Playback engine tying a decode worker, the ring buffer and a device stream together.
//!
//! The engine owns the single ring buffer and, per loaded track, an
//! [`EngineState`] shared with the device callback. The decode worker only
//! ever sees the ring buffer and is stopped and joined before a track's
//! state is replaced.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cadence_core::{EngineConfig, Error, Result, TrackMetadata};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, info_span, trace, warn, Span};

use crate::buffer::{shared_ring_buffer, SharedRingBuffer};
use crate::decode::{Decoder, FrameSource};
use crate::format::StreamFormat;
use crate::io::{DataSource, FileDataSource};
use crate::output::{AudioBackend, CallbackAction, OutputStream, StreamState, Volume};
use crate::worker::DecodeWorker;

/// Playback state of the audio engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    /// The device has drained the whole track.
    Finished,
}

/// Events emitted by the audio engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A track was loaded and started.
    TrackLoaded { duration_secs: f64 },
    /// Playback state changed.
    StateChanged(PlaybackState),
    /// Playback was repositioned (in seconds).
    Seeked(f64),
    /// The current track was torn down.
    Stopped,
}

/// State of one loaded track shared with the device callback.
struct EngineState {
    buffer: SharedRingBuffer,
    format: StreamFormat,
    /// Bytes of real audio delivered to the device, reset on seek.
    offset: AtomicU64,
    finished: AtomicBool,
    /// Raised by the decode worker once its last frame is in the buffer.
    decode_complete: Arc<AtomicBool>,
    underruns: AtomicU64,
    events: Sender<EngineEvent>,
}

impl EngineState {
    /// Answer a device request without blocking.
    ///
    /// Whole frames are popped from the ring buffer and any shortfall is
    /// filled with silence. Once the decoder is complete and the buffer runs
    /// dry the track is finished and the stream is corked.
    fn drain_or_silence(&self, out: &mut [u8]) -> CallbackAction {
        let frame_size = self.format.frame_size();
        let usable = out.len() - out.len() % frame_size;

        // Load before popping: if the decoder was complete before the pop, a
        // short read really is the end of the track.
        let complete = self.decode_complete.load(Ordering::Acquire);
        let read = self.buffer.pop_into(&mut out[..usable]);
        out[read..].fill(self.format.sample_format().silence_byte());
        self.offset.fetch_add(read as u64, Ordering::AcqRel);

        if read == usable {
            return CallbackAction::Continue;
        }

        if complete {
            if !self.finished.swap(true, Ordering::AcqRel) {
                trace!("Track drained after {} bytes", self.offset.load(Ordering::Acquire));
                let _ = self
                    .events
                    .send(EngineEvent::StateChanged(PlaybackState::Finished));
            }
            return CallbackAction::Cork;
        }

        self.underruns.fetch_add(1, Ordering::Relaxed);
        trace!("Underrun: wanted {} bytes, had {}", usable, read);
        CallbackAction::Continue
    }
}

struct ActiveTrack {
    state: Arc<EngineState>,
    worker: DecodeWorker<Decoder>,
    stream: Box<dyn OutputStream>,
    metadata: TrackMetadata,
    total_bytes: u64,
}

/// Real-time PCM playback engine.
///
/// Transport calls take `&mut self`; queries only read atomics and may be
/// issued from any thread holding a shared reference.
pub struct AudioEngine {
    backend: Box<dyn AudioBackend>,
    config: EngineConfig,
    /// Ring buffer shared with every decode worker.
    buffer: SharedRingBuffer,
    track: Option<ActiveTrack>,
    volume: f32,
    paused: bool,
    shut_down: bool,
    span: Span,
    event_tx: Sender<EngineEvent>,
    event_rx: Receiver<EngineEvent>,
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

impl AudioEngine {
    /// Create an engine that plays through `backend`.
    pub fn new(backend: Box<dyn AudioBackend>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (event_tx, event_rx) = unbounded();
        let span = info_span!("engine", stream = %config.stream_name);
        debug!(parent: &span, "Ring buffer capacity {} bytes", config.buffer_capacity);

        Ok(Self {
            backend,
            buffer: shared_ring_buffer(config.buffer_capacity),
            volume: clamp_volume(config.initial_volume),
            config,
            track: None,
            paused: false,
            shut_down: false,
            span,
            event_tx,
            event_rx,
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(Error::internal("Audio engine has been shut down"));
        }
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Load and start playing a track, replacing the current one.
    ///
    /// The container is parsed and its format checked against the backend
    /// before anything is torn down, so a rejected track leaves the current
    /// one playing.
    pub fn play_async(&mut self, source: Box<dyn DataSource>) -> Result<()> {
        self.ensure_running()?;

        let decoder = Decoder::open(source)?;
        let format = decoder.format();
        self.backend.check_format(&format)?;

        let metadata = decoder.metadata();
        let total_bytes = decoder.num_frames() * format.frame_size() as u64;

        self.teardown();

        let track_span = info_span!(
            parent: &self.span,
            "track",
            title = %metadata.display_title("untitled")
        );
        let mut worker = DecodeWorker::new(decoder, self.buffer.clone(), track_span);
        let state = Arc::new(EngineState {
            buffer: self.buffer.clone(),
            format,
            offset: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            decode_complete: worker.completion(),
            underruns: AtomicU64::new(0),
            events: self.event_tx.clone(),
        });

        let callback_state = state.clone();
        let mut stream = self.backend.open_stream(
            format,
            &self.config.stream_name,
            Box::new(move |out: &mut [u8]| callback_state.drain_or_silence(out)),
        )?;
        stream.set_volume(Volume::from_linear(self.volume))?;

        worker.start()?;
        state.offset.store(0, Ordering::Release);
        state.finished.store(false, Ordering::Release);
        stream.set_corked(false)?;
        self.paused = false;

        let duration_secs = format.bytes_to_seconds(total_bytes);
        info!(
            parent: &self.span,
            rate = format.sample_rate(),
            bits = format.sample_format().bytes_per_sample() * 8,
            channels = format.channels(),
            "Playing '{}' ({:.1} s)",
            metadata.display_title("untitled"),
            duration_secs
        );

        self.track = Some(ActiveTrack {
            state,
            worker,
            stream,
            metadata,
            total_bytes,
        });
        self.emit(EngineEvent::TrackLoaded { duration_secs });
        self.emit(EngineEvent::StateChanged(PlaybackState::Playing));
        Ok(())
    }

    /// Open a file and play it.
    pub fn play_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_running()?;
        let source = FileDataSource::open(path)?;
        self.play_async(Box::new(source))
    }

    /// Cork the stream, join the decode thread and close the stream.
    fn teardown(&mut self) -> bool {
        let Some(mut track) = self.track.take() else {
            return false;
        };
        if let Err(e) = track.stream.set_corked(true) {
            warn!(parent: &self.span, "Failed to cork stream during teardown: {e}");
        }
        track.worker.stop();
        drop(track);
        debug!(parent: &self.span, "Track torn down");
        true
    }

    /// Cork or uncork the device. Decoding continues while paused.
    pub fn pause(&mut self, paused: bool) -> Result<()> {
        self.ensure_running()?;
        if let Some(track) = self.track.as_mut() {
            let finished = track.state.finished.load(Ordering::Acquire);
            track.stream.set_corked(paused || finished)?;
        }
        if self.paused != paused {
            self.paused = paused;
            debug!(parent: &self.span, "Paused: {}", paused);
            self.emit(EngineEvent::StateChanged(self.state()));
        }
        Ok(())
    }

    /// Jump to `seconds`, clamped to the track. Returns once no audio from
    /// the old position can reach the device.
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        self.ensure_running()?;
        let total = self.total_song_time();
        let paused = self.paused;
        let track = self
            .track
            .as_mut()
            .ok_or_else(|| Error::internal("Seek with no track loaded"))?;

        let target = if seconds.is_nan() {
            0.0
        } else {
            seconds.clamp(0.0, total)
        };
        let was_finished = track.state.finished.load(Ordering::Acquire);

        track.stream.set_corked(true)?;
        let offset = track.state.format.byte_offset_at(target);
        track.state.offset.store(offset, Ordering::Release);
        // A failed seek has already ended the stream in the worker. The device
        // is still released so the callback drains it and finishes the track.
        let seeked = track.worker.seek(target);
        track.stream.flush()?;
        track.state.finished.store(false, Ordering::Release);
        if !paused {
            track.stream.set_corked(false)?;
        }
        seeked?;

        debug!(parent: &self.span, "Seeked to {:.3} s (requested {:.3} s)", target, seconds);
        self.emit(EngineEvent::Seeked(target));
        if was_finished {
            self.emit(EngineEvent::StateChanged(self.state()));
        }
        Ok(())
    }

    /// Set the sink volume, clamped to `[0, 1]`.
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.ensure_running()?;
        self.volume = clamp_volume(volume);
        if let Some(track) = self.track.as_mut() {
            track.stream.set_volume(Volume::from_linear(self.volume))?;
        }
        Ok(())
    }

    /// Tear down the current track, if any.
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_running()?;
        if self.teardown() {
            self.paused = false;
            self.emit(EngineEvent::Stopped);
            self.emit(EngineEvent::StateChanged(PlaybackState::Stopped));
        }
        Ok(())
    }

    /// Stop playback and refuse every later call.
    pub fn shutdown(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.stop()?;
        self.shut_down = true;
        info!(parent: &self.span, "Audio engine shut down");
        Ok(())
    }

    /// Position of the audio currently heard, in seconds.
    ///
    /// Bytes still queued in the device are not counted. Returns `0.0` until
    /// the device has reported timing.
    pub fn current_song_time(&self) -> f64 {
        let Some(track) = &self.track else {
            return 0.0;
        };
        let Some(timing) = track.stream.timing() else {
            return 0.0;
        };
        let offset = track.state.offset.load(Ordering::Acquire);
        let played = offset
            .saturating_sub(timing.queued_bytes())
            .min(track.total_bytes);
        track.state.format.bytes_to_seconds(played)
    }

    /// Length of the current track in seconds.
    pub fn total_song_time(&self) -> f64 {
        self.track.as_ref().map_or(0.0, |track| {
            track.state.format.bytes_to_seconds(track.total_bytes)
        })
    }

    pub fn is_finished(&self) -> bool {
        self.track
            .as_ref()
            .is_some_and(|track| track.state.finished.load(Ordering::Acquire))
    }

    /// Whether the device is silent: paused by the caller, or corked by the
    /// callback after the track drained.
    pub fn is_paused(&self) -> bool {
        self.paused
            || self
                .track
                .as_ref()
                .is_some_and(|track| track.stream.is_corked())
    }

    /// Whether the decoder has pushed the whole track into the ring buffer.
    pub fn is_decode_complete(&self) -> bool {
        self.track
            .as_ref()
            .is_some_and(|track| track.state.decode_complete.load(Ordering::Acquire))
    }

    pub fn state(&self) -> PlaybackState {
        match &self.track {
            None => PlaybackState::Stopped,
            Some(track) if track.state.finished.load(Ordering::Acquire) => {
                PlaybackState::Finished
            }
            Some(_) if self.paused => PlaybackState::Paused,
            Some(_) => PlaybackState::Playing,
        }
    }

    /// Device-side state of the current stream.
    pub fn stream_state(&self) -> Option<StreamState> {
        self.track.as_ref().map(|track| track.stream.state())
    }

    pub fn metadata(&self) -> Option<&TrackMetadata> {
        self.track.as_ref().map(|track| &track.metadata)
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.track.as_ref().map(|track| track.state.format)
    }

    /// Device requests for the current track that had to be padded with
    /// silence before the end of the stream.
    pub fn underruns(&self) -> u64 {
        self.track
            .as_ref()
            .map_or(0, |track| track.state.underruns.load(Ordering::Relaxed))
    }

    /// Get the current volume.
    pub const fn volume(&self) -> f32 {
        self.volume
    }

    /// Bytes decoded but not yet handed to the device.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Get the ring buffer fill level (0.0 to 1.0).
    #[allow(clippy::cast_precision_loss)]
    pub fn buffer_fill(&self) -> f32 {
        self.buffer.len() as f32 / self.buffer.capacity() as f32
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.try_recv().ok()
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if !self.shut_down {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::shared_ring_buffer;
    use crate::format::SampleFormat;
    use crate::output::ManualBackend;

    fn state_with(
        format: StreamFormat,
        buffered: &[u8],
        complete: bool,
    ) -> (EngineState, Receiver<EngineEvent>) {
        let buffer = shared_ring_buffer(1024);
        buffer.push(buffered).unwrap();
        let (events, rx) = unbounded();
        let state = EngineState {
            buffer,
            format,
            offset: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            decode_complete: Arc::new(AtomicBool::new(complete)),
            underruns: AtomicU64::new(0),
            events,
        };
        (state, rx)
    }

    fn stereo16() -> StreamFormat {
        StreamFormat::new(2, SampleFormat::S16Le, 44_100).unwrap()
    }

    #[test]
    fn test_end_of_stream_pads_with_silence_and_finishes() {
        let data: Vec<u8> = (1..=40).collect();
        let (state, events) = state_with(stereo16(), &data, true);

        let mut out = [0xAAu8; 100];
        assert_eq!(state.drain_or_silence(&mut out), CallbackAction::Cork);

        assert_eq!(&out[..40], data.as_slice());
        assert!(out[40..].iter().all(|&b| b == 0));
        assert!(state.finished.load(Ordering::Acquire));
        assert_eq!(state.offset.load(Ordering::Acquire), 40);
        assert_eq!(state.underruns.load(Ordering::Relaxed), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::StateChanged(PlaybackState::Finished)
        );
    }

    #[test]
    fn test_finished_event_sent_once() {
        let (state, events) = state_with(stereo16(), &[1u8; 8], true);

        let mut out = [0u8; 16];
        for _ in 0..4 {
            assert_eq!(state.drain_or_silence(&mut out), CallbackAction::Cork);
        }
        let finished: Vec<EngineEvent> = events.try_iter().collect();
        assert_eq!(
            finished,
            vec![EngineEvent::StateChanged(PlaybackState::Finished)]
        );
    }

    #[test]
    fn test_underrun_counts_and_keeps_playing() {
        let (state, _events) = state_with(stereo16(), &[5u8; 8], false);

        let mut out = [0xAAu8; 16];
        assert_eq!(state.drain_or_silence(&mut out), CallbackAction::Continue);
        assert_eq!(&out[..8], &[5u8; 8]);
        assert_eq!(&out[8..], &[0u8; 8]);
        assert!(!state.finished.load(Ordering::Acquire));
        assert_eq!(state.underruns.load(Ordering::Relaxed), 1);
        assert_eq!(state.offset.load(Ordering::Acquire), 8);
    }

    #[test]
    fn test_partial_frame_request_gets_silence_tail() {
        let (state, _events) = state_with(stereo16(), &[9u8; 64], false);

        // 10 bytes hold two whole 4-byte frames; the last 2 bytes are padding.
        let mut out = [0xAAu8; 10];
        assert_eq!(state.drain_or_silence(&mut out), CallbackAction::Continue);
        assert_eq!(&out[..8], &[9u8; 8]);
        assert_eq!(&out[8..], &[0u8; 2]);
        assert_eq!(state.offset.load(Ordering::Acquire), 8);
        assert_eq!(state.underruns.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_unsigned_silence() {
        let format = StreamFormat::new(1, SampleFormat::U8, 8_000).unwrap();
        let (state, _events) = state_with(format, &[], true);

        let mut out = [0u8; 6];
        assert_eq!(state.drain_or_silence(&mut out), CallbackAction::Cork);
        assert_eq!(out, [0x80; 6]);
    }

    #[test]
    fn test_engine_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AudioEngine>();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig::default().with_buffer_capacity(16);
        let result = AudioEngine::new(Box::new(ManualBackend::new()), config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_queries_without_track() {
        let engine =
            AudioEngine::new(Box::new(ManualBackend::new()), EngineConfig::default()).unwrap();
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert!((engine.current_song_time() - 0.0).abs() < f64::EPSILON);
        assert!((engine.total_song_time() - 0.0).abs() < f64::EPSILON);
        assert!(!engine.is_finished());
        assert!(engine.metadata().is_none());
        assert_eq!(engine.try_recv_event(), None);
    }
}
