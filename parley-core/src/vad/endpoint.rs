//! Debounced end-of-speech detection.
//!
//! ```text
//! Speech         → speech_observed = true, silence_run = 0
//! Silence        → silence_run += 1
//! Indeterminate  → silence_run = 0 (the run must be consecutive)
//!
//! silence_run > debounce && speech_observed && armed
//!     → emit SpeechEnded once, then clear both counters
//! ```
//!
//! `armed` is supplied by the caller on every frame: true only while a
//! recording is active and the turn state is Listening. Dead air before the
//! caller ever speaks cannot end a turn because `speech_observed` stays false.

use super::{VadDecision, VoiceActivityDetector};
use crate::buffering::frame::AudioFrame;

/// Default number of consecutive silent frames before speech is declared over.
/// At a 16 ms analyser tick this is roughly five seconds.
pub const DEFAULT_DEBOUNCE_FRAMES: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechEnded,
}

/// Result of feeding one frame through the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub decision: VadDecision,
    pub level_db: f32,
    pub event: Option<VadEvent>,
}

pub struct SpeechEndDetector {
    vad: Box<dyn VoiceActivityDetector>,
    debounce_frames: u32,
    speech_observed: bool,
    silence_run: u32,
}

impl SpeechEndDetector {
    pub fn new(vad: Box<dyn VoiceActivityDetector>, debounce_frames: u32) -> Self {
        Self {
            vad,
            debounce_frames,
            speech_observed: false,
            silence_run: 0,
        }
    }

    /// Classify `frame` and advance the counters.
    pub fn observe(&mut self, frame: &AudioFrame, armed: bool) -> Observation {
        let decision = self.vad.classify(frame);
        match decision {
            VadDecision::Speech => {
                self.speech_observed = true;
                self.silence_run = 0;
            }
            VadDecision::Silence => {
                self.silence_run = self.silence_run.saturating_add(1);
            }
            VadDecision::Indeterminate => {
                self.silence_run = 0;
            }
        }

        let event = if armed && self.speech_observed && self.silence_run > self.debounce_frames {
            tracing::debug!(
                silence_run = self.silence_run,
                debounce = self.debounce_frames,
                "speech ended"
            );
            self.speech_observed = false;
            self.silence_run = 0;
            Some(VadEvent::SpeechEnded)
        } else {
            None
        };

        Observation {
            decision,
            level_db: frame.level_db(),
            event,
        }
    }

    /// Clear both counters, e.g. when a fresh recording begins.
    pub fn reset(&mut self) {
        self.speech_observed = false;
        self.silence_run = 0;
        self.vad.reset();
    }

    pub fn speech_observed(&self) -> bool {
        self.speech_observed
    }

    pub fn silence_run(&self) -> u32 {
        self.silence_run
    }
}

impl std::fmt::Debug for SpeechEndDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechEndDetector")
            .field("debounce_frames", &self.debounce_frames)
            .field("speech_observed", &self.speech_observed)
            .field("silence_run", &self.silence_run)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::LevelVad;

    fn detector(debounce: u32) -> SpeechEndDetector {
        SpeechEndDetector::new(Box::new(LevelVad::default()), debounce)
    }

    fn speech() -> AudioFrame {
        AudioFrame::uniform(200, 64)
    }

    fn silence() -> AudioFrame {
        AudioFrame::uniform(5, 64)
    }

    fn feed(det: &mut SpeechEndDetector, frame: &AudioFrame, n: usize, armed: bool) -> usize {
        (0..n)
            .filter(|_| det.observe(frame, armed).event.is_some())
            .count()
    }

    #[test]
    fn fires_once_after_debounce_plus_one_silent_frames() {
        let mut det = detector(300);
        assert_eq!(feed(&mut det, &speech(), 10, true), 0);
        assert_eq!(feed(&mut det, &silence(), 300, true), 0);
        assert_eq!(feed(&mut det, &silence(), 1, true), 1);
        assert!(!det.speech_observed());
        assert_eq!(det.silence_run(), 0);
        // Counters were cleared; more silence alone never fires again.
        assert_eq!(feed(&mut det, &silence(), 1_000, true), 0);
    }

    #[test]
    fn silence_without_prior_speech_never_fires() {
        let mut det = detector(300);
        assert_eq!(feed(&mut det, &silence(), 2_000, true), 0);
    }

    #[test]
    fn does_not_fire_while_disarmed() {
        let mut det = detector(5);
        feed(&mut det, &speech(), 1, false);
        assert_eq!(feed(&mut det, &silence(), 50, false), 0);
        // Once armed the pending run qualifies on the next silent frame.
        assert_eq!(feed(&mut det, &silence(), 1, true), 1);
    }

    #[test]
    fn speech_in_the_middle_restarts_the_run() {
        let mut det = detector(10);
        feed(&mut det, &speech(), 1, true);
        assert_eq!(feed(&mut det, &silence(), 10, true), 0);
        feed(&mut det, &speech(), 1, true);
        assert_eq!(feed(&mut det, &silence(), 10, true), 0);
        assert_eq!(feed(&mut det, &silence(), 1, true), 1);
    }

    #[test]
    fn dead_band_frame_breaks_the_consecutive_run() {
        let mut det = detector(10);
        feed(&mut det, &speech(), 1, true);
        feed(&mut det, &silence(), 8, true);
        det.observe(&AudioFrame::uniform(36, 64), true);
        assert_eq!(det.silence_run(), 0);
        assert_eq!(feed(&mut det, &silence(), 10, true), 0);
        assert_eq!(feed(&mut det, &silence(), 1, true), 1);
    }

    #[test]
    fn reset_forgets_observed_speech() {
        let mut det = detector(3);
        feed(&mut det, &speech(), 1, true);
        det.reset();
        assert_eq!(feed(&mut det, &silence(), 20, true), 0);
    }

    #[test]
    fn observation_reports_level() {
        let mut det = detector(3);
        let obs = det.observe(&speech(), true);
        assert_eq!(obs.decision, VadDecision::Speech);
        assert!(obs.level_db > -13.0);
        assert!(obs.event.is_none());
    }
}
