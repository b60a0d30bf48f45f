//! Voice Activity Detection (VAD).
//!
//! Two layers:
//! - a `VoiceActivityDetector` classifies each `AudioFrame` on its own
//!   (`LevelVad` is the default, dB thresholds over the byte spectrum);
//! - `SpeechEndDetector` debounces those decisions into a single
//!   `SpeechEnded` event per utterance, gated on the call being in a
//!   recording Listening state.

pub mod endpoint;
pub mod level;

pub use endpoint::{SpeechEndDetector, VadEvent};
pub use level::LevelVad;

use crate::buffering::frame::AudioFrame;

/// Per-frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Level above the speech threshold.
    Speech,
    /// Level below the silence floor.
    Silence,
    /// Between the two thresholds: neither counts toward speech nor silence.
    Indeterminate,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for frame classifiers.
///
/// Implementors may be stateful (smoothing, adaptive floors, etc.).
pub trait VoiceActivityDetector: Send + 'static {
    /// Classify one analyser frame.
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision;

    /// Reset any internal state.
    fn reset(&mut self);
}
