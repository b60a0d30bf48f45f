//! Level-threshold VAD over the analyser's byte spectrum.
//!
//! ## Algorithm
//!
//! 1. Mean magnitude across bins → `level = 20 * log10(mean / 255)`.
//! 2. `level > speech_threshold_db` → `Speech`.
//! 3. `level < silence_floor_db` → `Silence`.
//! 4. Otherwise → `Indeterminate`, so energy hovering near a boundary
//!    neither extends speech nor advances the silence run.

use super::{VadDecision, VoiceActivityDetector};
use crate::buffering::frame::AudioFrame;

/// Default speech threshold in dB relative to full scale.
pub const DEFAULT_SPEECH_THRESHOLD_DB: f32 = -13.0;
/// Default silence floor in dB relative to full scale (more negative ⇒ quieter).
pub const DEFAULT_SILENCE_FLOOR_DB: f32 = -22.0;

#[derive(Debug, Clone)]
pub struct LevelVad {
    speech_threshold_db: f32,
    silence_floor_db: f32,
}

impl LevelVad {
    /// `silence_floor_db` should sit below `speech_threshold_db`; if the two
    /// are swapped they are reordered so the dead band stays well defined.
    pub fn new(speech_threshold_db: f32, silence_floor_db: f32) -> Self {
        let (speech_threshold_db, silence_floor_db) = if silence_floor_db > speech_threshold_db {
            tracing::warn!(
                speech_threshold_db,
                silence_floor_db,
                "silence floor above speech threshold; swapping"
            );
            (silence_floor_db, speech_threshold_db)
        } else {
            (speech_threshold_db, silence_floor_db)
        };
        Self {
            speech_threshold_db,
            silence_floor_db,
        }
    }

    pub fn speech_threshold_db(&self) -> f32 {
        self.speech_threshold_db
    }

    pub fn silence_floor_db(&self) -> f32 {
        self.silence_floor_db
    }
}

impl Default for LevelVad {
    fn default() -> Self {
        Self::new(DEFAULT_SPEECH_THRESHOLD_DB, DEFAULT_SILENCE_FLOOR_DB)
    }
}

impl VoiceActivityDetector for LevelVad {
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision {
        let level = frame.level_db();
        if level > self.speech_threshold_db {
            VadDecision::Speech
        } else if level < self.silence_floor_db {
            VadDecision::Silence
        } else {
            VadDecision::Indeterminate
        }
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loud_frame_is_speech() {
        let mut vad = LevelVad::default();
        let frame = AudioFrame::uniform(200, 1024);
        let level = frame.level_db();
        assert!(level > -2.5 && level < -1.5, "level={level}");
        assert_eq!(vad.classify(&frame), VadDecision::Speech);
    }

    #[test]
    fn quiet_frame_is_silence() {
        let mut vad = LevelVad::default();
        // 255 * 10^(-25/20) ≈ 14.3
        assert_eq!(vad.classify(&AudioFrame::uniform(14, 1024)), VadDecision::Silence);
        assert_eq!(vad.classify(&AudioFrame::uniform(0, 1024)), VadDecision::Silence);
    }

    #[test]
    fn dead_band_is_indeterminate() {
        let mut vad = LevelVad::default();
        // 255 * 10^(-17/20) ≈ 36 → -16.98 dB
        assert_eq!(
            vad.classify(&AudioFrame::uniform(36, 1024)),
            VadDecision::Indeterminate
        );
    }

    #[test]
    fn thresholds_are_reordered_when_swapped() {
        let vad = LevelVad::new(-30.0, -10.0);
        assert_eq!(vad.speech_threshold_db(), -10.0);
        assert_eq!(vad.silence_floor_db(), -30.0);
    }
}
