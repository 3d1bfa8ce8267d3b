//! Dominant-frequency estimation from a Hann-windowed FFT power spectrum

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Finds the strongest spectral component of a short audio window
pub struct SpectrumAnalyzer {
    sample_rate: u32,
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    /// Pre-computed Hann window
    window: Vec<f32>,
    /// Scratch buffer reused across calls
    buffer: Vec<Complex<f32>>,
}

impl std::fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("sample_rate", &self.sample_rate)
            .field("fft_size", &self.fft_size)
            .finish()
    }
}

impl SpectrumAnalyzer {
    /// Create an analyzer; `fft_size` is rounded up to a power of two
    pub fn new(sample_rate: u32, fft_size: usize) -> Self {
        let fft_size = fft_size.max(16).next_power_of_two();
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let window = (0..fft_size)
            .map(|i| {
                0.5 * (1.0
                    - ((2.0 * std::f32::consts::PI * i as f32) / (fft_size as f32 - 1.0)).cos())
            })
            .collect();

        Self {
            sample_rate,
            fft_size,
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    /// FFT length in samples
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of usable frequency bins (half the FFT length)
    pub fn num_bins(&self) -> usize {
        self.fft_size / 2
    }

    /// Frequency of a bin: `bin * (sample_rate / 2) / num_bins`
    pub fn bin_to_hz(&self, bin: usize) -> f64 {
        bin as f64 * (self.sample_rate as f64 / 2.0) / self.num_bins() as f64
    }

    /// Power spectrum (|X[k]|²) of the most recent `fft_size` samples
    ///
    /// Shorter input is right-aligned and zero-padded at the front.
    pub fn power_spectrum(&mut self, samples: &[f32]) -> Vec<f32> {
        let take = samples.len().min(self.fft_size);
        let pad = self.fft_size - take;
        let tail = &samples[samples.len() - take..];

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let s = if i < pad { 0.0 } else { tail[i - pad] };
            *slot = Complex::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        self.buffer[..self.num_bins()]
            .iter()
            .map(|c| c.norm_sqr())
            .collect()
    }

    /// Frequency (Hz) of the strongest non-DC bin, `None` for a silent window
    pub fn dominant_frequency(&mut self, samples: &[f32]) -> Option<f64> {
        let spectrum = self.power_spectrum(samples);
        let (bin, &power) = spectrum
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        if power <= f32::EPSILON {
            return None;
        }
        Some(self.bin_to_hz(bin))
    }
}
