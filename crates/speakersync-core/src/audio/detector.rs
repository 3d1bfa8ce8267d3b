//! Energy onset detection with frequency gating
//!
//! Consumes captured microphone audio in fixed-size chunks, learns the room's
//! noise floor during the first few hundred milliseconds, then reports every
//! energy burst whose dominant frequency matches one of the click tones.
//!
//! Timestamps are derived from the number of samples consumed since
//! [`OnsetDetector::start`], not from wall-clock time, so they are immune to
//! scheduling jitter between the capture thread and the consumer.

use super::rms;
use super::spectrum::SpectrumAnalyzer;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Block size used to pin the onset inside the triggering window
const ONSET_BLOCK: usize = 64;

/// Onset detector tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Samples per analysis chunk (~21ms at 48kHz)
    pub chunk_size: usize,
    /// Trailing window used for the dominant-frequency FFT
    pub fft_size: usize,
    /// Length of the initial noise-floor capture (ms)
    pub noise_floor_ms: f64,
    /// Lower bound on the onset threshold (RMS)
    pub min_threshold: f32,
    /// Threshold as a multiple of the measured noise floor
    pub noise_multiplier: f32,
    /// Minimum distance between accepted detections (ms)
    pub min_click_gap_ms: f64,
    /// Accepted distance between dominant and expected frequency (Hz)
    pub frequency_tolerance_hz: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            fft_size: 2048,
            noise_floor_ms: 500.0,
            min_threshold: 0.01,
            noise_multiplier: 3.0,
            min_click_gap_ms: 300.0,
            frequency_tolerance_hz: 100.0,
        }
    }
}

/// A detected click onset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Onset time relative to the capture session start (ms)
    pub timestamp_ms: f64,
    /// Dominant frequency of the burst (Hz)
    pub frequency_hz: f64,
    /// `min(1, rms / threshold)`
    pub confidence: f64,
}

/// Detector lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorState {
    /// Not consuming audio
    Idle,
    /// Measuring the ambient noise floor
    CapturingNoiseFloor,
    /// Looking for onsets
    Listening,
}

/// Chunked RMS onset detector
///
/// # Example
/// ```
/// use speakersync_core::audio::detector::{DetectorConfig, DetectorState, OnsetDetector};
///
/// let mut detector = OnsetDetector::new(48000, DetectorConfig::default(), vec![1000.0]);
/// detector.start();
/// assert_eq!(detector.state(), DetectorState::CapturingNoiseFloor);
///
/// // One second of silence: noise floor done, nothing detected
/// let detections = detector.push_samples(&vec![0.0; 48000]);
/// assert!(detections.is_empty());
/// assert_eq!(detector.state(), DetectorState::Listening);
/// ```
#[derive(Debug)]
pub struct OnsetDetector {
    sample_rate: u32,
    config: DetectorConfig,
    expected_frequencies: Vec<f64>,
    state: DetectorState,
    spectrum: SpectrumAnalyzer,
    /// Trailing samples for FFT and onset refinement
    history: VecDeque<f32>,
    history_len: usize,
    /// Partial chunk carried between `push_samples` calls
    pending: Vec<f32>,
    /// Samples consumed since start
    frames_processed: u64,
    noise_floor_frames: u64,
    noise_sum_sq: f64,
    noise_count: u64,
    noise_floor: Option<f32>,
    threshold: f32,
    min_gap_frames: u64,
    last_detection_frame: Option<u64>,
}

impl OnsetDetector {
    /// Create an idle detector for the given click tones
    pub fn new(sample_rate: u32, config: DetectorConfig, expected_frequencies: Vec<f64>) -> Self {
        let spectrum = SpectrumAnalyzer::new(sample_rate, config.fft_size);
        let chunk_size = config.chunk_size.max(ONSET_BLOCK);
        let history_len = spectrum.fft_size().max(2 * chunk_size);
        let noise_floor_frames = ms_to_frames(config.noise_floor_ms, sample_rate);
        let min_gap_frames = ms_to_frames(config.min_click_gap_ms, sample_rate);
        let threshold = config.min_threshold;

        Self {
            sample_rate,
            config: DetectorConfig {
                chunk_size,
                ..config
            },
            expected_frequencies,
            state: DetectorState::Idle,
            spectrum,
            history: VecDeque::with_capacity(history_len),
            history_len,
            pending: Vec::with_capacity(chunk_size),
            frames_processed: 0,
            noise_floor_frames,
            noise_sum_sq: 0.0,
            noise_count: 0,
            noise_floor: None,
            threshold,
            min_gap_frames,
            last_detection_frame: None,
        }
    }

    /// Begin a capture session: clears all state and starts noise-floor capture
    pub fn start(&mut self) {
        self.history.clear();
        self.pending.clear();
        self.frames_processed = 0;
        self.noise_sum_sq = 0.0;
        self.noise_count = 0;
        self.noise_floor = None;
        self.threshold = self.config.min_threshold;
        self.last_detection_frame = None;

        if self.noise_floor_frames == 0 {
            self.state = DetectorState::Listening;
        } else {
            self.state = DetectorState::CapturingNoiseFloor;
        }
        tracing::debug!(state = ?self.state, "detector_started");
    }

    /// End the capture session; further input is ignored
    pub fn stop(&mut self) {
        self.state = DetectorState::Idle;
        self.pending.clear();
        tracing::debug!(frames = self.frames_processed, "detector_stopped");
    }

    /// Feed an arbitrary number of samples, processed in fixed-size chunks
    ///
    /// Leftover samples that do not fill a chunk are kept for the next call.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<Detection> {
        let mut detections = Vec::new();
        if self.state == DetectorState::Idle {
            return detections;
        }

        self.pending.extend_from_slice(samples);
        let chunk_size = self.config.chunk_size;
        let full = self.pending.len() / chunk_size * chunk_size;
        if full == 0 {
            return detections;
        }

        let ready: Vec<f32> = self.pending.drain(..full).collect();
        for chunk in ready.chunks(chunk_size) {
            if let Some(detection) = self.process_chunk(chunk) {
                detections.push(detection);
            }
        }
        detections
    }

    /// Process one chunk of samples
    ///
    /// Returns a detection when the chunk carries an accepted onset.
    pub fn process_chunk(&mut self, chunk: &[f32]) -> Option<Detection> {
        if self.state == DetectorState::Idle || chunk.is_empty() {
            return None;
        }

        let chunk_start = self.frames_processed;
        self.frames_processed += chunk.len() as u64;
        self.history.extend(chunk.iter().copied());
        while self.history.len() > self.history_len {
            self.history.pop_front();
        }

        let level = rms(chunk);

        if self.state == DetectorState::CapturingNoiseFloor {
            self.noise_sum_sq += chunk.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>();
            self.noise_count += chunk.len() as u64;
            if self.frames_processed >= self.noise_floor_frames {
                self.finish_noise_floor();
            }
            return None;
        }

        if level <= self.threshold {
            return None;
        }

        if let Some(last) = self.last_detection_frame {
            if chunk_start.saturating_sub(last) < self.min_gap_frames {
                tracing::trace!(chunk_start, last, "onset_within_gap");
                return None;
            }
        }

        let frequency = {
            let window = self.history.make_contiguous();
            self.spectrum.dominant_frequency(window)?
        };

        if !self.matches_expected(frequency) {
            tracing::debug!(
                frequency_hz = %format!("{:.1}", frequency),
                rms = level,
                "onset_rejected_frequency"
            );
            return None;
        }

        let onset_frame = self.refine_onset(chunk_start);
        self.last_detection_frame = Some(onset_frame);

        let detection = Detection {
            timestamp_ms: onset_frame as f64 / self.sample_rate as f64 * 1000.0,
            frequency_hz: frequency,
            confidence: (level / self.threshold).min(1.0) as f64,
        };

        tracing::debug!(
            timestamp_ms = %format!("{:.3}", detection.timestamp_ms),
            frequency_hz = %format!("{:.1}", frequency),
            rms = level,
            threshold = self.threshold,
            "onset_detected"
        );

        Some(detection)
    }

    fn finish_noise_floor(&mut self) {
        let floor = if self.noise_count > 0 {
            (self.noise_sum_sq / self.noise_count as f64).sqrt() as f32
        } else {
            0.0
        };
        self.noise_floor = Some(floor);
        self.threshold = self
            .config
            .min_threshold
            .max(floor * self.config.noise_multiplier);
        self.state = DetectorState::Listening;

        tracing::info!(
            noise_floor = floor,
            threshold = self.threshold,
            "noise_floor_captured"
        );
    }

    fn matches_expected(&self, frequency: f64) -> bool {
        self.expected_frequencies
            .iter()
            .any(|&f| (frequency - f).abs() <= self.config.frequency_tolerance_hz)
    }

    /// Locate the first block above threshold in the last two chunks
    ///
    /// Search never reaches back into the gap after the previous detection.
    fn refine_onset(&self, chunk_start: u64) -> u64 {
        let history_start = self.frames_processed - self.history.len() as u64;
        let mut search_start = self
            .frames_processed
            .saturating_sub(2 * self.config.chunk_size as u64)
            .max(history_start);
        if let Some(last) = self.last_detection_frame {
            search_start = search_start.max(last + self.min_gap_frames);
        }
        if search_start >= chunk_start {
            return chunk_start;
        }

        let (front, back) = self.history.as_slices();
        let mut block = Vec::with_capacity(ONSET_BLOCK);
        let mut frame = search_start;
        while frame < self.frames_processed {
            block.clear();
            let offset = (frame - history_start) as usize;
            let end = (offset + ONSET_BLOCK).min(self.history.len());
            for idx in offset..end {
                let s = if idx < front.len() {
                    front[idx]
                } else {
                    back[idx - front.len()]
                };
                block.push(s);
            }
            if rms(&block) > self.threshold {
                return frame;
            }
            frame += ONSET_BLOCK as u64;
        }
        chunk_start
    }

    /// Current lifecycle state
    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// True once the noise floor is known and onsets are being detected
    pub fn is_listening(&self) -> bool {
        self.state == DetectorState::Listening
    }

    /// Measured noise floor RMS, once captured
    pub fn noise_floor(&self) -> Option<f32> {
        self.noise_floor
    }

    /// Current onset threshold (RMS)
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Time covered by the samples consumed so far (ms)
    pub fn elapsed_ms(&self) -> f64 {
        self.frames_processed as f64 / self.sample_rate as f64 * 1000.0
    }

    /// Time covered by every sample pushed so far, including a partial chunk
    /// still waiting to be processed (ms)
    pub fn received_ms(&self) -> f64 {
        (self.frames_processed + self.pending.len() as u64) as f64 / self.sample_rate as f64 * 1000.0
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Active configuration
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}

fn ms_to_frames(ms: f64, sample_rate: u32) -> u64 {
    (ms.max(0.0) / 1000.0 * sample_rate as f64).round() as u64
}
