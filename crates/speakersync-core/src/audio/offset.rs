//! Detection-to-schedule matching and robust offset reduction
//!
//! Turns the onset detector's output into a single playback offset:
//!
//! 1. A coarse offset is seeded from the first few detections.
//! 2. Each detection is paired, greedily and in arrival order, with the
//!    nearest unconsumed schedule entry of the same tone.
//! 3. Pair differences are reduced to a mean with 2σ outlier rejection, and
//!    the spread of the survivors becomes the confidence.

use super::click::ClickSchedule;
use super::detector::Detection;
use serde::{Deserialize, Serialize};

/// Aggregator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Accepted distance between detected and scheduled tone (Hz)
    ///
    /// Deliberately separate from the detector's own tolerance.
    pub frequency_tolerance_hz: f64,
    /// Maximum distance from the seeded expectation for a pairing (ms)
    pub match_window_ms: f64,
    /// How many leading detections may seed the coarse offset
    pub seed_detections: usize,
    /// Pairs further than this many standard deviations from the mean are rejected
    pub outlier_std_devs: f64,
    /// Standard deviation at which confidence reaches zero (ms)
    pub confidence_spread_ms: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            frequency_tolerance_hz: 150.0,
            match_window_ms: 300.0,
            seed_detections: 5,
            outlier_std_devs: 2.0,
            confidence_spread_ms: 50.0,
        }
    }
}

/// Confidence reported when outlier rejection leaves nothing to average
const UNFILTERED_CONFIDENCE: f64 = 0.5;

/// One detection paired with the schedule entry it was attributed to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    /// Scheduled onset (ms)
    pub expected_time_ms: f64,
    /// Detected onset (ms)
    pub detected_time_ms: f64,
}

impl MatchedPair {
    /// `detected - expected` (ms)
    pub fn difference_ms(&self) -> f64 {
        self.detected_time_ms - self.expected_time_ms
    }
}

/// Outcome of reducing a set of detections to one offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetReport {
    /// Final offset (ms); positive means the speaker is late
    pub offset_ms: f64,
    /// Standard deviation of the kept differences (ms)
    pub std_dev_ms: f64,
    /// `clamp(1 - std_dev / 50, 0, 1)`
    pub confidence: f64,
    /// All pairings produced by matching
    pub matched: Vec<MatchedPair>,
    /// Differences discarded as outliers (ms)
    pub rejected_ms: Vec<f64>,
    /// Coarse offset used to center the match window, if one was found
    pub seed_offset_ms: Option<f64>,
}

impl OffsetReport {
    /// Report for an empty input: zero offset, zero confidence
    pub fn empty() -> Self {
        Self {
            offset_ms: 0.0,
            std_dev_ms: 0.0,
            confidence: 0.0,
            matched: Vec::new(),
            rejected_ms: Vec::new(),
            seed_offset_ms: None,
        }
    }

    /// Number of pairings
    pub fn matched_count(&self) -> usize {
        self.matched.len()
    }

    /// Number of pairings discarded as outliers
    pub fn rejected_count(&self) -> usize {
        self.rejected_ms.len()
    }
}

/// Matches detections against a click schedule and reduces them to an offset
///
/// # Example
/// ```
/// use speakersync_core::audio::click::{generate_schedule, ClickTrackConfig};
/// use speakersync_core::audio::detector::Detection;
/// use speakersync_core::audio::offset::{AggregatorConfig, OffsetAggregator};
///
/// let schedule = generate_schedule(&ClickTrackConfig::default());
/// let detections: Vec<Detection> = schedule
///     .iter()
///     .map(|e| Detection {
///         timestamp_ms: e.expected_time_ms + 10.0,
///         frequency_hz: e.frequency_hz,
///         confidence: 1.0,
///     })
///     .collect();
///
/// let report = OffsetAggregator::new(AggregatorConfig::default())
///     .calculate_average_offset(&detections, &schedule);
/// assert!((report.offset_ms - 10.0).abs() < 1e-9);
/// assert!(report.confidence > 0.99);
/// ```
#[derive(Debug, Clone, Default)]
pub struct OffsetAggregator {
    config: AggregatorConfig,
}

impl OffsetAggregator {
    /// Create an aggregator
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    fn frequency_matches(&self, detected_hz: f64, expected_hz: f64) -> bool {
        (detected_hz - expected_hz).abs() <= self.config.frequency_tolerance_hz
    }

    /// Coarse offset from the leading detections
    ///
    /// For each of the first `seed_detections` detections, the first schedule
    /// entry with a matching tone gives `detected - expected`; the first hit
    /// wins. `None` when no leading detection matches any tone.
    pub fn seed_offset(&self, detections: &[Detection], schedule: &ClickSchedule) -> Option<f64> {
        detections
            .iter()
            .take(self.config.seed_detections)
            .find_map(|det| {
                schedule
                    .iter()
                    .find(|e| self.frequency_matches(det.frequency_hz, e.frequency_hz))
                    .map(|e| det.timestamp_ms - e.expected_time_ms)
            })
    }

    /// Pair detections with schedule entries
    ///
    /// Each schedule entry is consumed at most once. Detections with no
    /// frequency-compatible entry inside the match window are dropped.
    pub fn match_detections(
        &self,
        detections: &[Detection],
        schedule: &ClickSchedule,
        seed_offset_ms: Option<f64>,
    ) -> Vec<MatchedPair> {
        let center = seed_offset_ms.unwrap_or(0.0);
        let mut consumed = vec![false; schedule.len()];
        let mut pairs = Vec::with_capacity(detections.len().min(schedule.len()));

        for det in detections {
            let best = schedule
                .iter()
                .enumerate()
                .filter(|(i, e)| {
                    !consumed[*i] && self.frequency_matches(det.frequency_hz, e.frequency_hz)
                })
                .map(|(i, e)| (i, (det.timestamp_ms - (e.expected_time_ms + center)).abs()))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match best {
                Some((i, distance)) if distance < self.config.match_window_ms => {
                    consumed[i] = true;
                    pairs.push(MatchedPair {
                        expected_time_ms: schedule.events()[i].expected_time_ms,
                        detected_time_ms: det.timestamp_ms,
                    });
                }
                _ => {
                    tracing::trace!(
                        timestamp_ms = det.timestamp_ms,
                        frequency_hz = det.frequency_hz,
                        "detection_unmatched"
                    );
                }
            }
        }
        pairs
    }

    /// Reduce matched pairs to mean offset, spread and confidence
    pub fn reduce_pairs(&self, pairs: &[MatchedPair]) -> OffsetReport {
        if pairs.is_empty() {
            return OffsetReport::empty();
        }

        let differences: Vec<f64> = pairs.iter().map(MatchedPair::difference_ms).collect();
        let (mean, std_dev) = mean_std(&differences);

        let limit = self.config.outlier_std_devs * std_dev;
        let (kept, rejected): (Vec<f64>, Vec<f64>) = differences
            .iter()
            .partition(|&&d| std_dev == 0.0 || (d - mean).abs() < limit);

        let (offset_ms, std_dev_ms, confidence) = if kept.is_empty() {
            (mean, std_dev, UNFILTERED_CONFIDENCE)
        } else {
            let (m, s) = mean_std(&kept);
            let c = (1.0 - s / self.config.confidence_spread_ms).clamp(0.0, 1.0);
            (m, s, c)
        };

        if !rejected.is_empty() {
            tracing::debug!(
                rejected = ?rejected,
                raw_mean = mean,
                raw_std_dev = std_dev,
                "offset_outliers_rejected"
            );
        }

        OffsetReport {
            offset_ms,
            std_dev_ms,
            confidence,
            matched: pairs.to_vec(),
            rejected_ms: rejected,
            seed_offset_ms: None,
        }
    }

    /// Full pipeline: seed, match, reduce
    pub fn calculate_average_offset(
        &self,
        detections: &[Detection],
        schedule: &ClickSchedule,
    ) -> OffsetReport {
        let seed = self.seed_offset(detections, schedule);
        let pairs = self.match_detections(detections, schedule, seed);
        let mut report = self.reduce_pairs(&pairs);
        report.seed_offset_ms = seed;

        tracing::info!(
            detections = detections.len(),
            matched = report.matched_count(),
            rejected = report.rejected_count(),
            offset_ms = %format!("{:.3}", report.offset_ms),
            std_dev_ms = %format!("{:.3}", report.std_dev_ms),
            confidence = %format!("{:.3}", report.confidence),
            seeded = seed.is_some(),
            "offset_calculated"
        );
        report
    }
}

/// Mean and population standard deviation (0, 0 for an empty slice)
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
