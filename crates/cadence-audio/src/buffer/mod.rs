//! Bounded buffer shared between the decode thread and the audio callback.

pub mod ring;

pub use ring::{shared_ring_buffer, PushOutcome, RingBuffer, SharedRingBuffer};
