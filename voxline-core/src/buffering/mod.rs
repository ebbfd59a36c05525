//! Lock-free SPSC ring buffer for captured samples, plus the typed audio
//! containers used across the crate.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use chunk::{AudioBuffer, AudioChunk, AudioFormat, CaptureFrame, Direction};
pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the capture worker thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^18 = 262 144 f32 samples ≈ 5.4 s at 48 kHz.
/// A call only needs to absorb scheduling jitter, not a whole utterance.
pub const RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
