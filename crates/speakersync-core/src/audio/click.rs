//! Click track generation for acoustic offset calibration
//!
//! Produces a deterministic sequence of short Hann-windowed sine bursts, one
//! every `click_interval_ms`, with the tone frequency rotating through a
//! configured list. The same configuration yields the ground-truth schedule
//! that detections are later matched against.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Click track configuration
///
/// Callers must keep `click_interval_ms > click_duration_ms`, otherwise
/// neighbouring click envelopes overlap. The model itself does not check this;
/// see [`crate::config::CalibrationConfig::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickTrackConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Total track duration in seconds
    pub total_duration_sec: f64,
    /// Duration of a single click in milliseconds
    pub click_duration_ms: f64,
    /// Distance between click starts in milliseconds
    pub click_interval_ms: f64,
    /// Tone frequencies, used cyclically
    pub frequencies: Vec<f64>,
    /// Peak amplitude (0.0 to 1.0)
    pub amplitude: f32,
}

impl Default for ClickTrackConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            total_duration_sec: 20.0,
            click_duration_ms: 50.0,
            click_interval_ms: 1000.0,
            frequencies: vec![500.0, 1000.0, 2000.0, 3000.0],
            amplitude: 0.8,
        }
    }
}

impl ClickTrackConfig {
    /// Total track duration in milliseconds
    pub fn total_duration_ms(&self) -> f64 {
        self.total_duration_sec * 1000.0
    }

    /// Number of clicks the track contains
    pub fn num_clicks(&self) -> usize {
        if self.click_interval_ms <= 0.0 || self.frequencies.is_empty() {
            return 0;
        }
        (self.total_duration_ms() / self.click_interval_ms).floor().max(0.0) as usize
    }
}

/// One expected click: when it starts relative to playback start and its tone
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    /// Expected onset relative to track start (ms)
    pub expected_time_ms: f64,
    /// Tone frequency (Hz)
    pub frequency_hz: f64,
}

/// Ordered, immutable expected-event schedule of a click track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickSchedule {
    events: Vec<ClickEvent>,
}

impl ClickSchedule {
    /// Build the schedule for a configuration (see [`generate_schedule`])
    pub fn generate(config: &ClickTrackConfig) -> Self {
        generate_schedule(config)
    }

    /// All events in playback order
    pub fn events(&self) -> &[ClickEvent] {
        &self.events
    }

    /// Number of expected clicks
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when the schedule holds no clicks
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Event at position `index`
    pub fn get(&self, index: usize) -> Option<&ClickEvent> {
        self.events.get(index)
    }

    /// Iterate over events in order
    pub fn iter(&self) -> std::slice::Iter<'_, ClickEvent> {
        self.events.iter()
    }
}

/// Generate the expected-event schedule
///
/// `floor(total_duration_sec * 1000 / click_interval_ms)` events; event `i`
/// sits at `i * click_interval_ms` with `frequencies[i % frequencies.len()]`.
///
/// # Example
/// ```
/// use speakersync_core::audio::click::{generate_schedule, ClickTrackConfig};
///
/// let schedule = generate_schedule(&ClickTrackConfig::default());
/// assert_eq!(schedule.len(), 20);
/// assert_eq!(schedule.events()[1].expected_time_ms, 1000.0);
/// ```
pub fn generate_schedule(config: &ClickTrackConfig) -> ClickSchedule {
    let events = (0..config.num_clicks())
        .map(|i| ClickEvent {
            expected_time_ms: i as f64 * config.click_interval_ms,
            frequency_hz: config.frequencies[i % config.frequencies.len()],
        })
        .collect();
    ClickSchedule { events }
}

/// Synthesize one click: a sine burst shaped by a Hann envelope
///
/// `N = duration_ms / 1000 * sample_rate`, sample `i` is
/// `amplitude * 0.5 * (1 - cos(2πi/N)) * sin(2πfi/sample_rate)`. The window
/// starts and ends at zero so the burst has no hard edges to leak energy
/// into neighbouring frequency bins.
pub fn synthesize_click(
    frequency_hz: f64,
    duration_ms: f64,
    amplitude: f32,
    sample_rate: u32,
) -> Vec<f32> {
    let n = (duration_ms / 1000.0 * sample_rate as f64).round().max(0.0) as usize;
    let sr = sample_rate as f64;
    (0..n)
        .map(|i| {
            let envelope = 0.5 * (1.0 - (2.0 * PI * i as f64 / n as f64).cos());
            let tone = (2.0 * PI * frequency_hz * i as f64 / sr).sin();
            (amplitude as f64 * envelope * tone) as f32
        })
        .collect()
}

/// Rendered stereo click track (both channels identical)
#[derive(Debug, Clone, PartialEq)]
pub struct StereoTrack {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Left channel
    pub left: Vec<f32>,
    /// Right channel
    pub right: Vec<f32>,
}

impl StereoTrack {
    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.left.len()
    }

    /// Duration in milliseconds
    pub fn duration_ms(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64 * 1000.0
    }

    /// Interleave into L R L R ... order
    pub fn interleaved(&self) -> Vec<f32> {
        self.left
            .iter()
            .zip(&self.right)
            .flat_map(|(&l, &r)| [l, r])
            .collect()
    }

    /// Interleaved 16-bit PCM, clamped to [-1, 1] before scaling
    pub fn to_pcm16(&self) -> Vec<i16> {
        self.interleaved().into_iter().map(to_pcm16_sample).collect()
    }
}

/// Convert one float sample to 16-bit PCM
pub fn to_pcm16_sample(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 0x7FFF as f32) as i16
}

/// Render the full click track into silent stereo buffers
///
/// Click `i` starts at `i * interval_samples`; a click running past the end of
/// the track is truncated.
pub fn render_track(config: &ClickTrackConfig) -> StereoTrack {
    let sr = config.sample_rate as f64;
    let total_samples = (config.total_duration_sec * sr).round().max(0.0) as usize;
    let interval_samples = (config.click_interval_ms / 1000.0 * sr).round() as usize;

    let mut left = vec![0.0f32; total_samples];
    let schedule = generate_schedule(config);

    for (i, event) in schedule.iter().enumerate() {
        let start = i * interval_samples;
        if start >= total_samples {
            break;
        }
        let click = synthesize_click(
            event.frequency_hz,
            config.click_duration_ms,
            config.amplitude,
            config.sample_rate,
        );
        let end = (start + click.len()).min(total_samples);
        left[start..end].copy_from_slice(&click[..end - start]);
    }

    tracing::debug!(
        clicks = schedule.len(),
        frames = total_samples,
        sample_rate = config.sample_rate,
        "click_track_rendered"
    );

    let right = left.clone();
    StereoTrack {
        sample_rate: config.sample_rate,
        left,
        right,
    }
}
