//! Microphone capture, spectrum analysis and recording.
//!
//! ```text
//! MicrophoneSource::open ──► InputStream (OS audio thread)
//!                                │  push_slice (lock-free)
//!                                ▼
//!                         SPSC ring buffer
//!                                │  drained once per analyser tick
//!                 ┌──────────────┴──────────────┐
//!                 ▼                             ▼
//!            Analyser → AudioFrame        Recorder → encoded chunks
//!                 │                             │
//!                VAD                   stop() → Recording
//! ```
//!
//! The real-time callback only writes into the ring buffer; all analysis and
//! encoding happens on the engine's event loop.

pub mod analyser;
pub mod capture;
pub mod device;
pub mod encoding;
pub mod microphone;

pub use analyser::{Analyser, AnalyserConfig};
pub use capture::{AudioCaptureSession, Recording};
pub use encoding::{ChunkEncoder, EncoderRegistry, NegotiatedEncoding};

#[cfg(feature = "audio-cpal")]
pub use microphone::CpalMicrophone;

use serde::{Deserialize, Serialize};

use crate::{
    buffering::{AudioConsumer, AudioProducer},
    error::Result,
    lifecycle::Releasable,
};

/// Processing requested from the capture backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Exact device name to open; `None` lets the backend choose.
    pub preferred_input_device: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            preferred_input_device: None,
        }
    }
}

/// Something that can open a microphone and feed mono f32 PCM into a ring buffer.
pub trait MicrophoneSource: Send + Sync {
    /// Open an input and start pushing samples into `producer`.
    ///
    /// # Errors
    /// `DeviceAccess` / `NoInputDevice` when the microphone cannot be opened.
    fn open(
        &self,
        constraints: &CaptureConstraints,
        producer: AudioProducer,
    ) -> Result<Box<dyn InputStream>>;
}

/// A live input stream. Dropping the handle without `stop` must still stop capture.
pub trait InputStream: Send {
    /// Capture rate of the samples pushed into the ring buffer (Hz).
    fn sample_rate(&self) -> u32;

    /// Stop capture and release the device.
    fn stop(&mut self);

    /// Reason the device stopped delivering audio, if it failed mid-stream.
    /// Once set it stays set.
    fn fault(&self) -> Option<String> {
        None
    }
}

/// The microphone resource held by a call: the live stream plus the consumer
/// half of its ring buffer.
pub struct MicrophoneStream {
    input: Box<dyn InputStream>,
    consumer: AudioConsumer,
}

impl MicrophoneStream {
    pub fn new(input: Box<dyn InputStream>, consumer: AudioConsumer) -> Self {
        Self { input, consumer }
    }

    pub fn sample_rate(&self) -> u32 {
        self.input.sample_rate()
    }

    pub fn fault(&self) -> Option<String> {
        self.input.fault()
    }

    pub fn consumer_mut(&mut self) -> &mut AudioConsumer {
        &mut self.consumer
    }
}

impl Releasable for MicrophoneStream {
    fn release(&mut self) {
        self.input.stop();
    }
}
