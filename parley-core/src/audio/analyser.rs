//! Byte-spectrum analyser.
//!
//! Turns the most recent `fft_size` PCM samples into an `AudioFrame` of
//! `fft_size / 2` bins on a 0–255 scale:
//!
//! ```text
//! Blackman window → FFT → |X[k]| / N → temporal smoothing
//!     → dB → linear map [min_decibels, max_decibels] → [0, 255]
//! ```
//!
//! The mapping matches the common browser analyser convention, so VAD
//! thresholds calibrated against that scale carry over unchanged.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::buffering::frame::AudioFrame;
use crate::lifecycle::Releasable;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyserConfig {
    /// Power of two. Default: 2048 (1024 bins).
    pub fft_size: usize,
    /// Weight of the previous frame in [0, 1). Default: 0.8.
    pub smoothing: f32,
    /// dB mapped to byte 0. Default: -100.
    pub min_decibels: f32,
    /// dB mapped to byte 255. Default: -30.
    pub max_decibels: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

pub struct Analyser {
    config: AnalyserConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// Last `fft_size` samples, oldest first.
    history: Vec<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl Analyser {
    pub fn new(mut config: AnalyserConfig) -> Self {
        config.fft_size = config.fft_size.max(32).next_power_of_two();
        config.smoothing = config.smoothing.clamp(0.0, 0.99);
        if config.max_decibels <= config.min_decibels {
            config.max_decibels = config.min_decibels + 1.0;
        }
        let n = config.fft_size;
        Self {
            fft: FftPlanner::<f32>::new().plan_fft_forward(n),
            window: blackman_window(n),
            history: vec![0.0; n],
            smoothed: vec![0.0; n / 2],
            scratch: vec![Complex::new(0.0, 0.0); n],
            config,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.config.fft_size / 2
    }

    /// Append freshly captured samples, keeping only the last `fft_size`.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let n = self.history.len();
        if samples.len() >= n {
            self.history.copy_from_slice(&samples[samples.len() - n..]);
            return;
        }
        self.history.rotate_left(samples.len());
        self.history[n - samples.len()..].copy_from_slice(samples);
    }

    /// Compute the current byte spectrum.
    pub fn frame(&mut self) -> AudioFrame {
        let n = self.config.fft_size;
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            *slot = Complex::new(self.history[i] * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let tau = self.config.smoothing;
        let range = self.config.max_decibels - self.config.min_decibels;
        let scale = 255.0 / range;
        let min_db = self.config.min_decibels;
        let bins = self
            .smoothed
            .iter_mut()
            .zip(self.scratch.iter())
            .map(|(prev, x)| {
                let magnitude = x.norm() / n as f32;
                *prev = tau * *prev + (1.0 - tau) * magnitude;
                let db = if *prev > 0.0 {
                    20.0 * prev.log10()
                } else {
                    f32::NEG_INFINITY
                };
                let byte = (scale * (db - min_db)).floor();
                byte.clamp(0.0, 255.0) as u8
            })
            .collect();

        AudioFrame::new(bins)
    }

    /// Forget buffered audio and smoothing state.
    pub fn clear(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|s| *s = 0.0);
    }
}

impl Releasable for Analyser {
    fn release(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn blackman_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    let (a0, a1, a2) = (0.42, 0.5, 0.08);
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsmoothed() -> Analyser {
        Analyser::new(AnalyserConfig {
            smoothing: 0.0,
            ..AnalyserConfig::default()
        })
    }

    /// Deterministic full-band noise in [-amp, amp].
    fn noise(len: usize, amp: f32) -> Vec<f32> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32 * 2.0 - 1.0) * amp
            })
            .collect()
    }

    #[test]
    fn silence_maps_to_zero_bins() {
        let mut analyser = unsmoothed();
        analyser.push_samples(&vec![0.0; 4096]);
        let frame = analyser.frame();
        assert_eq!(frame.bins.len(), 1024);
        assert!(frame.bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let mut analyser = unsmoothed();
        let n = 2048;
        let k = 64; // exact bin-centred frequency
        let sine: Vec<f32> = (0..n)
            .map(|i| 0.01 * (2.0 * std::f32::consts::PI * k as f32 * i as f32 / n as f32).sin())
            .collect();
        analyser.push_samples(&sine);
        let frame = analyser.frame();
        let peak = frame
            .bins
            .iter()
            .enumerate()
            .max_by_key(|(_, &b)| b)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, k);
        assert!(frame.bins[k] > 150);
        assert!(frame.bins[k] < 255);
    }

    #[test]
    fn loud_noise_reads_as_speech_level() {
        let mut analyser = unsmoothed();
        analyser.push_samples(&noise(2048, 0.5));
        let level = analyser.frame().level_db();
        assert!(level > -13.0, "level={level}");
    }

    #[test]
    fn push_keeps_only_the_latest_window() {
        let mut analyser = unsmoothed();
        analyser.push_samples(&noise(2048, 0.5));
        analyser.push_samples(&vec![0.0; 2048]);
        assert!(analyser.frame().bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn clear_resets_history() {
        let mut analyser = Analyser::new(AnalyserConfig::default());
        analyser.push_samples(&noise(1000, 0.8));
        analyser.clear();
        assert!(analyser.frame().bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn config_is_sanitised() {
        let analyser = Analyser::new(AnalyserConfig {
            fft_size: 1000,
            ..AnalyserConfig::default()
        });
        assert_eq!(analyser.bin_count(), 512);
    }
}
