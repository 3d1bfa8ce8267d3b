//! Audio processing module
//!
//! This module contains all audio-side calibration functionality:
//! - Click track generation and expected-event schedule ([`click`])
//! - PCM WAV encoding of the rendered track ([`wav`])
//! - Energy onset detection with frequency gating ([`detector`])
//! - Dominant-frequency estimation via FFT ([`spectrum`])
//! - Detection-to-schedule matching and robust offset reduction ([`offset`])
//! - Template cross-correlation for single high-resolution offsets ([`correlation`])

pub mod click;
pub mod correlation;
pub mod detector;
pub mod offset;
pub mod spectrum;
pub mod wav;

/// Root-mean-square level of a block of samples (0.0 for an empty block)
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}
