//! Template cross-correlation for sub-sample onset alignment
//!
//! Slides a zero-mean, unit-variance copy of the click template over the
//! captured signal and scores every lag with a normalized dot product, so the
//! score does not depend on capture gain. The best integer lag is refined with
//! a parabola through its neighbours.
//!
//! Dot products for all lags come from one FFT round trip; overlap energies
//! come from prefix sums of squares.

use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

/// Peak-to-background distance (in standard deviations) that maps to full confidence
const FULL_CONFIDENCE_Z: f64 = 10.0;

/// Window energy treated as silence
const SILENCE_ENERGY: f64 = 1e-9;

/// Best alignment of a template inside a signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    /// Template start relative to signal start, in samples (fractional after refinement)
    pub lag_samples: f64,
    /// Same lag in milliseconds
    pub lag_ms: f64,
    /// Normalized correlation at the peak, in [-1, 1]
    pub peak: f64,
    /// Peak prominence over the other lags, in [0, 1]
    pub confidence: f64,
}

/// Locate `template` inside `signal`
///
/// Lag `L` places template sample 0 at signal sample `L`; negative lags mean
/// the template began before the capture. Only lags where at least half of
/// the template overlaps the signal are scored. Returns `None` when either
/// input is empty or the template is constant.
pub fn cross_correlate(signal: &[f32], template: &[f32], sample_rate: u32) -> Option<CorrelationResult> {
    if signal.is_empty() || template.is_empty() || sample_rate == 0 {
        return None;
    }
    let normalized = z_normalize(template)?;

    let t_len = template.len() as i64;
    let scores = correlation_scores(signal, &normalized);

    let (peak_idx, peak) = scores
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.map(|v| (i, v)))
        .max_by(|a, b| a.1.total_cmp(&b.1))?;

    let refined = peak_idx as f64 + parabolic_offset(&scores, peak_idx).unwrap_or(0.0);
    let lag_samples = refined - (t_len - 1) as f64;

    let valid: Vec<f64> = scores.iter().flatten().copied().collect();
    let confidence = prominence(&valid, peak);

    tracing::trace!(
        lag_samples,
        peak,
        confidence,
        lags = valid.len(),
        "correlation_peak"
    );

    Some(CorrelationResult {
        lag_samples,
        lag_ms: lag_samples / sample_rate as f64 * 1000.0,
        peak,
        confidence,
    })
}

fn z_normalize(template: &[f32]) -> Option<Vec<f64>> {
    let n = template.len() as f64;
    let mean = template.iter().map(|&s| s as f64).sum::<f64>() / n;
    let variance = template
        .iter()
        .map(|&s| (s as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    if variance <= f64::EPSILON {
        return None;
    }
    let std = variance.sqrt();
    Some(template.iter().map(|&s| (s as f64 - mean) / std).collect())
}

/// Normalized correlation per lag; index `k` holds lag `k - (template.len() - 1)`
///
/// Lags where less than half of the template overlaps the signal are `None`.
fn correlation_scores(signal: &[f32], template: &[f64]) -> Vec<Option<f64>> {
    let t_len = template.len() as i64;
    let s_len = signal.len() as i64;
    let min_overlap = (t_len + 1) / 2;

    let dots = sliding_dot_products(signal, template);
    let template_energy = prefix_energy(template.iter().copied());
    let signal_energy = prefix_energy(signal.iter().map(|&s| s as f64));

    (-(t_len - 1)..s_len)
        .map(|lag| {
            let start = (-lag).max(0);
            let end = t_len.min(s_len - lag);
            if end - start < min_overlap {
                return None;
            }
            let t_energy = template_energy[end as usize] - template_energy[start as usize];
            let w_energy = (signal_energy[(lag + end) as usize]
                - signal_energy[(lag + start) as usize])
                .max(0.0);
            if w_energy <= SILENCE_ENERGY || t_energy <= SILENCE_ENERGY {
                return Some(0.0);
            }
            let dot = dots[(lag + t_len - 1) as usize];
            Some((dot / (t_energy * w_energy).sqrt()).clamp(-1.0, 1.0))
        })
        .collect()
}

/// `sum_j template[j] * signal[lag + j]` for every lag in `-(t_len - 1)..s_len`
fn sliding_dot_products(signal: &[f32], template: &[f64]) -> Vec<f64> {
    let t_len = template.len();
    let lags = signal.len() + t_len - 1;
    let fft_size = lags.next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_size);
    let ifft = planner.plan_fft_inverse(fft_size);

    let zero = Complex::new(0.0, 0.0);
    let mut signal_spectrum: Vec<Complex<f64>> = signal
        .iter()
        .map(|&s| Complex::new(s as f64, 0.0))
        .chain(std::iter::repeat(zero))
        .take(fft_size)
        .collect();
    let mut template_spectrum: Vec<Complex<f64>> = template
        .iter()
        .map(|&t| Complex::new(t, 0.0))
        .chain(std::iter::repeat(zero))
        .take(fft_size)
        .collect();
    fft.process(&mut signal_spectrum);
    fft.process(&mut template_spectrum);

    for (s, t) in signal_spectrum.iter_mut().zip(&template_spectrum) {
        *s *= t.conj();
    }
    ifft.process(&mut signal_spectrum);

    // Circular index of lag L is L mod fft_size
    let norm = 1.0 / fft_size as f64;
    (0..lags)
        .map(|k| {
            let lag = k as i64 - (t_len as i64 - 1);
            let idx = lag.rem_euclid(fft_size as i64) as usize;
            signal_spectrum[idx].re * norm
        })
        .collect()
}

/// `out[i]` is the energy of the first `i` values
fn prefix_energy(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut out = vec![0.0];
    let mut total = 0.0;
    for v in values {
        total += v * v;
        out.push(total);
    }
    out
}

/// Vertex of the parabola through the peak and its two neighbours
fn parabolic_offset(scores: &[Option<f64>], idx: usize) -> Option<f64> {
    let left = scores.get(idx.checked_sub(1)?)?.as_ref()?;
    let center = scores.get(idx)?.as_ref()?;
    let right = scores.get(idx + 1)?.as_ref()?;

    let denom = left - 2.0 * center + right;
    if denom.abs() <= f64::EPSILON {
        return None;
    }
    let delta = 0.5 * (left - right) / denom;
    (delta.abs() < 1.0).then_some(delta)
}

fn prominence(scores: &[f64], peak: f64) -> f64 {
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let std = (scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std <= f64::EPSILON {
        return 0.0;
    }
    ((peak - mean) / std / FULL_CONFIDENCE_Z).clamp(0.0, 1.0)
}
