//! Background decode thread feeding the ring buffer.
//!
//! The worker owns its [`FrameSource`]. Decoding happens under the worker's
//! control lock so pause and seek can prove the thread is idle; pushing into
//! the ring buffer happens outside it, so a producer blocked on a full buffer
//! never holds a lock a control call needs.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cadence_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, Span};

use crate::buffer::{PushOutcome, SharedRingBuffer};
use crate::decode::{DecodeStatus, FrameSource};

/// Lifecycle of a decode worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Constructed, thread not started.
    #[default]
    Idle,
    /// Decoding and pushing frames.
    Running,
    /// Waiting; set by control calls or after end of stream.
    Paused,
    /// Thread is exiting.
    ShuttingDown,
}

struct Control<S> {
    state: WorkerState,
    source: S,
}

struct Shared<S> {
    control: Mutex<Control<S>>,
    wake: Condvar,
}

/// Threaded decoder with a small pause/seek/stop state machine.
pub struct DecodeWorker<S: FrameSource + 'static> {
    shared: Arc<Shared<S>>,
    buffer: SharedRingBuffer,
    /// Set once the last frame of the stream (or the frame before a read
    /// failure) has been pushed.
    completion: Arc<AtomicBool>,
    span: Span,
    handle: Option<JoinHandle<()>>,
}

impl<S: FrameSource + 'static> DecodeWorker<S> {
    /// Bind a source to the ring buffer. Worker log lines are emitted inside `span`.
    pub fn new(source: S, buffer: SharedRingBuffer, span: Span) -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: WorkerState::Idle,
                    source,
                }),
                wake: Condvar::new(),
            }),
            buffer,
            completion: Arc::new(AtomicBool::new(false)),
            span,
            handle: None,
        }
    }

    /// Flag raised when the stream has been fully pushed. Read with `Acquire`.
    pub fn completion(&self) -> Arc<AtomicBool> {
        self.completion.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.shared.control.lock().state
    }

    pub const fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// Reset the buffer and launch the decode thread.
    ///
    /// Calling `start` while a thread exists is a programming error.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::internal("decode worker is already running"));
        }

        self.buffer.reset();
        self.completion.store(false, Ordering::Release);
        self.shared.control.lock().state = WorkerState::Running;

        let shared = self.shared.clone();
        let buffer = self.buffer.clone();
        let completion = self.completion.clone();
        let span = self.span.clone();

        let handle = std::thread::Builder::new()
            .name("decode-worker".to_string())
            .spawn(move || {
                let _entered = span.enter();
                run(&shared, &buffer, &completion);
            })
            .map_err(|e| {
                self.shared.control.lock().state = WorkerState::Idle;
                Error::Internal(format!("Failed to spawn decode thread: {e}"))
            })?;

        self.handle = Some(handle);
        debug!(parent: &self.span, "Decode worker started");
        Ok(())
    }

    /// Hold the thread off after its current frame.
    pub fn pause(&self) {
        let mut control = self.shared.control.lock();
        if control.state == WorkerState::Running {
            control.state = WorkerState::Paused;
        }
    }

    /// Let a paused thread continue.
    pub fn resume(&self) {
        let mut control = self.shared.control.lock();
        if control.state == WorkerState::Paused {
            control.state = WorkerState::Running;
            self.shared.wake.notify_all();
        }
    }

    /// Reposition the stream. On return no frame from before the seek can
    /// reach the buffer.
    ///
    /// If the source fails to seek, the stream ends as it would at end of
    /// stream: the buffer stays empty, completion is raised and the error is
    /// returned.
    pub fn seek(&self, seconds: f64) -> Result<()> {
        let mut control = self.shared.control.lock();
        if control.state == WorkerState::ShuttingDown {
            return Err(Error::internal("seek on a decode worker that is shutting down"));
        }
        let was_started = control.state != WorkerState::Idle;
        control.state = WorkerState::Paused;

        self.buffer.reset();
        if let Err(e) = control.source.seek_to(seconds) {
            error!(parent: &self.span, "Seek to {:.3} s failed, ending stream: {e}", seconds);
            if was_started {
                finish(&mut control, &self.completion);
            } else {
                control.state = WorkerState::Idle;
                self.completion.store(true, Ordering::Release);
            }
            return Err(e);
        }
        self.completion.store(false, Ordering::Release);

        if was_started {
            control.state = WorkerState::Running;
            self.shared.wake.notify_all();
        } else {
            control.state = WorkerState::Idle;
        }
        drop(control);

        debug!(parent: &self.span, "Decode worker seeked to {:.3} s", seconds);
        Ok(())
    }

    /// Shut the thread down and join it. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.buffer.abort(true);
        {
            let mut control = self.shared.control.lock();
            control.state = WorkerState::ShuttingDown;
            self.shared.wake.notify_all();
        }

        if handle.join().is_err() {
            error!(parent: &self.span, "Decode thread panicked");
        }
        self.buffer.abort(false);
        debug!(parent: &self.span, "Decode worker stopped");
    }
}

impl<S: FrameSource + 'static> Drop for DecodeWorker<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Mark the stream complete and park the thread.
fn finish<S>(control: &mut Control<S>, completion: &AtomicBool) {
    control.state = WorkerState::Paused;
    completion.store(true, Ordering::Release);
}

fn run<S: FrameSource>(shared: &Shared<S>, buffer: &SharedRingBuffer, completion: &AtomicBool) {
    let mut frame = vec![0u8; shared.control.lock().source.format().frame_size()];
    let mut frames: u64 = 0;

    loop {
        let generation = {
            let mut control = shared.control.lock();
            while matches!(control.state, WorkerState::Idle | WorkerState::Paused) {
                shared.wake.wait(&mut control);
            }
            if control.state == WorkerState::ShuttingDown {
                break;
            }

            let generation = buffer.generation();
            match control.source.decode_frame(&mut frame) {
                Ok(DecodeStatus::Frame) => generation,
                Ok(DecodeStatus::EndOfStream) => {
                    debug!("End of stream after {} frames", frames);
                    finish(&mut control, completion);
                    continue;
                }
                Err(e) => {
                    error!("Decode failed, ending stream: {e}");
                    finish(&mut control, completion);
                    continue;
                }
            }
        };

        match buffer.push_for_generation(&frame, generation) {
            Ok(PushOutcome::Written) => frames += 1,
            Ok(PushOutcome::Stale) => trace!("Dropped frame decoded before a seek"),
            Ok(PushOutcome::Aborted) => trace!("Push aborted"),
            Err(e) => {
                error!("Frame does not fit the ring buffer: {e}");
                finish(&mut shared.control.lock(), completion);
            }
        }
    }

    trace!("Decode loop exited");
}
