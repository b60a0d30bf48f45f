//! Analyser output consumed by the VAD on every tick.

/// Largest value a byte-spectrum bin can hold.
pub const MAX_MAGNITUDE: f32 = 255.0;

/// Per-bin energy magnitudes on a 0–255 scale, sampled once per analyser tick.
///
/// Frames are ephemeral: the VAD reads one and drops it.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub bins: Vec<u8>,
}

impl AudioFrame {
    pub fn new(bins: Vec<u8>) -> Self {
        Self { bins }
    }

    /// A frame whose every bin holds `magnitude`.
    pub fn uniform(magnitude: u8, bin_count: usize) -> Self {
        Self {
            bins: vec![magnitude; bin_count],
        }
    }

    /// Mean magnitude across all bins, `0.0` for an empty frame.
    pub fn mean_magnitude(&self) -> f32 {
        if self.bins.is_empty() {
            return 0.0;
        }
        let sum: u32 = self.bins.iter().map(|&b| b as u32).sum();
        sum as f32 / self.bins.len() as f32
    }

    /// Logarithmic level relative to full scale: `20 * log10(mean / 255)`.
    ///
    /// A silent frame yields `f32::NEG_INFINITY`, which compares below any floor.
    pub fn level_db(&self) -> f32 {
        20.0 * (self.mean_magnitude() / MAX_MAGNITUDE).log10()
    }
}
