//! # cadence-audio
//!
//! Real-time PCM playback pipeline for Cadence.
//!
//! Features:
//! - Bounded byte ring buffer between the decode thread and the device callback
//! - Threaded frame decoder with pause/seek/stop control
//! - Playback engine that answers device callbacks without ever blocking
//! - cpal output plus a caller-driven backend for headless use

pub mod buffer;
pub mod decode;
pub mod engine;
pub mod format;
pub mod io;
pub mod output;
pub mod wav;
pub mod worker;

pub use buffer::{shared_ring_buffer, PushOutcome, RingBuffer, SharedRingBuffer};
pub use decode::{DecodeStatus, Decoder, FrameSource, WavDecoder};
pub use engine::{AudioEngine, EngineEvent, PlaybackState};
pub use format::{SampleFormat, StreamFormat};
pub use io::{DataSource, FileDataSource, MemoryDataSource};
pub use output::{
    AudioBackend, CallbackAction, CpalBackend, ManualBackend, ManualDevice, OutputStream,
    StreamState, TimingInfo, Volume,
};
pub use wav::{InfoTag, WavFormat, WavParser};
pub use worker::{DecodeWorker, WorkerState};
