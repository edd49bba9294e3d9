//! Bounded byte ring buffer for PCM streaming.
//!
//! One decode thread pushes whole frames and blocks while the buffer is full;
//! the device callback pops whatever is available and never waits. A single
//! mutex guards the cursors and is only held for cursor arithmetic and copies.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::Arc;

use cadence_core::{Error, Result};
use parking_lot::{Condvar, Mutex};

/// What happened to a blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The bytes were copied into the buffer.
    Written,
    /// The buffer was aborting; nothing was written.
    Aborted,
    /// The buffer was cleared since the caller's generation; nothing was written.
    Stale,
}

struct Inner {
    storage: Box<[u8]>,
    head: usize,
    tail: usize,
    size: usize,
    aborting: bool,
    /// Bumped on every clear so producers can detect data made stale by a reset.
    generation: u64,
}

impl Inner {
    fn write(&mut self, bytes: &[u8]) {
        let capacity = self.storage.len();
        let first = bytes.len().min(capacity - self.tail);
        self.storage[self.tail..self.tail + first].copy_from_slice(&bytes[..first]);
        self.storage[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.tail = (self.tail + bytes.len()) % capacity;
        self.size += bytes.len();
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        let to_read = out.len().min(self.size);
        if to_read == 0 {
            return 0;
        }
        let capacity = self.storage.len();
        let first = to_read.min(capacity - self.head);
        out[..first].copy_from_slice(&self.storage[self.head..self.head + first]);
        out[first..to_read].copy_from_slice(&self.storage[..to_read - first]);
        self.head = (self.head + to_read) % capacity;
        self.size -= to_read;
        to_read
    }
}

/// Fixed-capacity, blocking-producer / non-blocking-consumer byte ring.
///
/// A push is admitted only while `len() + bytes.len() < capacity()`, so the
/// ring is never completely full and `head == tail` always means empty.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    /// Signalled whenever space may have become available or the abort flag changed.
    space: Condvar,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring buffer holding at most `capacity - 1` bytes.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                storage: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                size: 0,
                aborting: false,
                generation: 0,
            }),
            space: Condvar::new(),
            capacity,
        }
    }

    /// Get the buffer capacity in bytes.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of bytes available for reading.
    pub fn len(&self) -> usize {
        self.inner.lock().size
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether pushes are currently being refused.
    pub fn is_aborting(&self) -> bool {
        self.inner.lock().aborting
    }

    /// Current clear generation, for use with [`RingBuffer::push_for_generation`].
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Push bytes, blocking until there is room or the buffer is aborted.
    ///
    /// Pushing `capacity()` bytes or more can never succeed and is reported
    /// as [`Error::Internal`] instead of blocking forever.
    pub fn push(&self, bytes: &[u8]) -> Result<PushOutcome> {
        self.push_inner(bytes, None)
    }

    /// Like [`RingBuffer::push`], but drops the bytes if the buffer has been
    /// cleared since `generation` was read.
    pub fn push_for_generation(&self, bytes: &[u8], generation: u64) -> Result<PushOutcome> {
        self.push_inner(bytes, Some(generation))
    }

    fn push_inner(&self, bytes: &[u8], generation: Option<u64>) -> Result<PushOutcome> {
        if bytes.len() >= self.capacity {
            return Err(Error::Internal(format!(
                "push of {} bytes can never fit a ring buffer of capacity {}",
                bytes.len(),
                self.capacity
            )));
        }

        let mut inner = self.inner.lock();
        loop {
            if inner.aborting {
                return Ok(PushOutcome::Aborted);
            }
            if generation.is_some_and(|g| g != inner.generation) {
                return Ok(PushOutcome::Stale);
            }
            if inner.size + bytes.len() < self.capacity {
                break;
            }
            self.space.wait(&mut inner);
        }

        inner.write(bytes);
        Ok(PushOutcome::Written)
    }

    /// Pop up to `out.len()` bytes into `out` without blocking.
    ///
    /// Returns the number of bytes copied, possibly zero. Does not allocate.
    pub fn pop_into(&self, out: &mut [u8]) -> usize {
        let read = self.inner.lock().read(out);
        if read > 0 {
            self.space.notify_all();
        }
        read
    }

    /// Pop up to `max_len` bytes without blocking.
    pub fn pop(&self, max_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; max_len.min(self.capacity)];
        let read = self.pop_into(&mut out);
        out.truncate(read);
        out
    }

    /// Drop all buffered bytes and wake blocked producers.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            inner.head = 0;
            inner.tail = 0;
            inner.size = 0;
            inner.generation = inner.generation.wrapping_add(1);
        }
        self.space.notify_all();
    }

    /// While set, every blocked and future push returns without writing.
    pub fn abort(&self, abort: bool) {
        self.inner.lock().aborting = abort;
        self.space.notify_all();
    }

    /// Abort, clear and re-arm in the order that releases a blocked producer
    /// before the reset and accepts new pushes afterwards.
    pub fn reset(&self) {
        self.abort(true);
        self.clear();
        self.abort(false);
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("size", &inner.size)
            .field("head", &inner.head)
            .field("tail", &inner.tail)
            .field("aborting", &inner.aborting)
            .finish()
    }
}

/// Thread-safe reference to a ring buffer.
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer.
pub fn shared_ring_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_basic_push_pop() {
        let buffer = RingBuffer::new(64);

        assert_eq!(buffer.push(&[1, 2, 3, 4, 5]).unwrap(), PushOutcome::Written);
        assert_eq!(buffer.len(), 5);

        assert_eq!(buffer.pop(5), vec![1, 2, 3, 4, 5]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_pop() {
        let buffer = RingBuffer::new(64);
        buffer.push(&[9, 8, 7]).unwrap();

        assert_eq!(buffer.pop(2), vec![9, 8]);
        assert_eq!(buffer.pop(10), vec![7]);
        assert_eq!(buffer.pop(10), Vec::<u8>::new());
    }

    #[test]
    fn test_wraparound() {
        let buffer = RingBuffer::new(8);

        buffer.push(&[1; 6]).unwrap();
        assert_eq!(buffer.pop(4), vec![1; 4]);

        // Tail wraps past the end of storage.
        buffer.push(&[2; 5]).unwrap();

        let mut out = [0u8; 7];
        assert_eq!(buffer.pop_into(&mut out), 7);
        assert_eq!(out, [1, 1, 2, 2, 2, 2, 2]);
    }

    #[test]
    fn test_clear_then_pop_is_empty() {
        let buffer = RingBuffer::new(32);
        buffer.push(&[3; 20]).unwrap();

        buffer.clear();
        assert!(buffer.pop(16).is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_oversized_push_is_an_error() {
        let buffer = RingBuffer::new(16);
        assert!(buffer.push(&[0; 16]).is_err());
        assert!(buffer.push(&[0; 40]).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fourth_frame_blocks_until_space() {
        let buffer = shared_ring_buffer(16);
        for frame in 0..3u8 {
            assert_eq!(buffer.push(&[frame; 4]).unwrap(), PushOutcome::Written);
        }

        let (tx, rx) = mpsc::channel();
        let producer = buffer.clone();
        let handle = thread::spawn(move || {
            let outcome = producer.push(&[3; 4]).unwrap();
            tx.send(outcome).unwrap();
        });

        // 12 + 4 would fill the ring completely, so the producer must wait.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        assert_eq!(buffer.pop(4), vec![0; 4]);
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, PushOutcome::Written);
        handle.join().unwrap();

        assert_eq!(buffer.pop(12), [[1u8; 4], [2; 4], [3; 4]].concat());
    }

    #[test]
    fn test_abort_releases_blocked_producer() {
        let buffer = shared_ring_buffer(8);
        buffer.push(&[1; 7]).unwrap();

        let (tx, rx) = mpsc::channel();
        let producer = buffer.clone();
        let handle = thread::spawn(move || {
            tx.send(producer.push(&[2; 4]).unwrap()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        buffer.abort(true);
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, PushOutcome::Aborted);
        handle.join().unwrap();

        // Nothing from the aborted push landed.
        assert_eq!(buffer.len(), 7);
        assert_eq!(buffer.push(&[5]).unwrap(), PushOutcome::Aborted);

        buffer.abort(false);
        buffer.clear();
        assert_eq!(buffer.push(&[6; 3]).unwrap(), PushOutcome::Written);
        assert_eq!(buffer.pop(8), vec![6; 3]);
    }

    #[test]
    fn test_clear_wakes_blocked_producer() {
        let buffer = shared_ring_buffer(8);
        buffer.push(&[1; 6]).unwrap();

        let producer = buffer.clone();
        let handle = thread::spawn(move || producer.push(&[2; 4]).unwrap());

        thread::sleep(Duration::from_millis(20));
        buffer.clear();

        assert_eq!(handle.join().unwrap(), PushOutcome::Written);
        assert_eq!(buffer.pop(8), vec![2; 4]);
    }

    #[test]
    fn test_stale_generation_is_dropped() {
        let buffer = RingBuffer::new(32);
        let generation = buffer.generation();

        buffer.reset();
        assert_eq!(
            buffer.push_for_generation(&[1, 2], generation).unwrap(),
            PushOutcome::Stale
        );
        assert!(buffer.is_empty());

        let current = buffer.generation();
        assert_eq!(
            buffer.push_for_generation(&[1, 2], current).unwrap(),
            PushOutcome::Written
        );
    }

    #[test]
    fn test_concurrent_fifo_order() {
        let buffer = shared_ring_buffer(64);
        let producer = buffer.clone();

        let writer = thread::spawn(move || {
            for i in 0..2000u32 {
                let frame = i.to_le_bytes();
                assert_eq!(producer.push(&frame).unwrap(), PushOutcome::Written);
            }
        });

        let mut received = Vec::with_capacity(8000);
        let mut scratch = [0u8; 20];
        while received.len() < 8000 {
            let n = buffer.pop_into(&mut scratch);
            received.extend_from_slice(&scratch[..n]);
            if n == 0 {
                thread::yield_now();
            }
        }
        writer.join().unwrap();

        for (i, chunk) in received.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            assert_eq!(value as usize, i);
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(Vec<u8>),
        Pop(usize),
        Clear,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => proptest::collection::vec(any::<u8>(), 0..12).prop_map(Op::Push),
            4 => (0usize..20).prop_map(Op::Pop),
            1 => Just(Op::Clear),
        ]
    }

    proptest! {
        #[test]
        fn prop_fifo_matches_model(ops in proptest::collection::vec(op_strategy(), 0..200)) {
            let buffer = RingBuffer::new(24);
            let mut model: VecDeque<u8> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Push(bytes) => {
                        // Only issue pushes that would not block a single-threaded test.
                        if model.len() + bytes.len() < buffer.capacity() {
                            prop_assert_eq!(buffer.push(&bytes).unwrap(), PushOutcome::Written);
                            model.extend(bytes);
                        }
                    }
                    Op::Pop(n) => {
                        let got = buffer.pop(n);
                        let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                        prop_assert_eq!(got, expected);
                    }
                    Op::Clear => {
                        buffer.clear();
                        model.clear();
                    }
                }
                prop_assert!(buffer.len() < buffer.capacity());
                prop_assert_eq!(buffer.len(), model.len());
            }
        }
    }
}
