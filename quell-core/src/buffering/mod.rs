//! Lock-free SPSC ring buffers for audio samples and fixed-size framing.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod chunk;
pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use frame::{FrameBuffer, FRAME_BYTES, FRAME_SIZE, SAMPLE_RATE};
pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the capture callback or the frame processor.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the worker thread or a recorder.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Capture ring capacity: 2^18 = 262 144 f32 samples ≈ 5.4 s at 48 kHz.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 18;

/// Output/recording tap capacity: 4 s at 48 kHz.
pub const TAP_RING_CAPACITY: usize = SAMPLE_RATE as usize * 4;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring(capacity: usize) -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}
