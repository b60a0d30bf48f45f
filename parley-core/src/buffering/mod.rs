//! Lock-free SPSC ring buffer between the microphone callback and the call
//! engine's analyser tick, plus the `AudioFrame` type the VAD consumes.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, drained by the engine on every analyser tick.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// 2^20 f32 samples ≈ 21.8 s at 48 kHz. The engine drains every few
/// milliseconds, so this only fills if the event loop stalls.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Drain everything currently buffered into `out`, returning the number of
/// samples appended.
pub fn drain_into(consumer: &mut AudioConsumer, out: &mut Vec<f32>) -> usize {
    let mut scratch = [0f32; 1024];
    let mut total = 0;
    loop {
        let n = consumer.pop_slice(&mut scratch);
        if n == 0 {
            break;
        }
        out.extend_from_slice(&scratch[..n]);
        total += n;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_collects_all_pushed_samples_in_order() {
        let (mut producer, mut consumer) = create_audio_ring();
        let samples: Vec<f32> = (0..3000).map(|i| i as f32).collect();
        producer.push_slice(&samples);

        let mut out = Vec::new();
        assert_eq!(drain_into(&mut consumer, &mut out), 3000);
        assert_eq!(out, samples);
        assert_eq!(drain_into(&mut consumer, &mut out), 0);
    }
}
