//! Calibration outcome and the correction derived from it

use crate::audio::offset::OffsetReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the click track reached the speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// The endpoint played the hosted track
    Remote,
    /// The remote command failed and the track was played locally
    LocalFallback,
}

/// Result of one calibration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub endpoint_id: String,
    pub endpoint_name: String,
    /// Playback delay of the endpoint (ms); positive means late
    pub offset_ms: f64,
    /// 0..=1, from the spread of the matched pairs
    pub confidence: f64,
    /// Detections reported by the onset detector
    pub detected_count: usize,
    /// Clicks in the schedule
    pub total_expected: usize,
    /// Detections paired with a schedule entry
    pub matched_count: usize,
    /// Pairs discarded as outliers
    pub rejected_count: usize,
    /// Spread of the kept pairs (ms)
    pub std_dev_ms: f64,
    /// False when the session continued without clock sync
    pub clock_synced: bool,
    pub playback: PlaybackMode,
    pub completed_at: DateTime<Utc>,
}

impl CalibrationResult {
    /// Assemble a result from an aggregation report
    pub fn from_report(
        endpoint_id: impl Into<String>,
        endpoint_name: impl Into<String>,
        report: &OffsetReport,
        detected_count: usize,
        total_expected: usize,
        clock_synced: bool,
        playback: PlaybackMode,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            endpoint_name: endpoint_name.into(),
            offset_ms: report.offset_ms,
            confidence: report.confidence,
            detected_count,
            total_expected,
            matched_count: report.matched_count(),
            rejected_count: report.rejected_count(),
            std_dev_ms: report.std_dev_ms,
            clock_synced,
            playback,
            completed_at: Utc::now(),
        }
    }

    /// Fraction of expected clicks that were detected
    pub fn detection_rate(&self) -> f64 {
        if self.total_expected == 0 {
            0.0
        } else {
            self.detected_count as f64 / self.total_expected as f64
        }
    }

    /// Correction payload for the endpoint
    pub fn to_correction(&self) -> OffsetCorrection {
        OffsetCorrection {
            endpoint_id: self.endpoint_id.clone(),
            offset_ms: self.offset_ms,
            source: crate::CORRECTION_SOURCE.to_string(),
            timestamp: Some(self.completed_at.timestamp_millis()),
        }
    }
}

/// Correction applied to an endpoint's playback delay
///
/// Wire shape: `{"endpointId", "offsetMs", "source", "timestamp"?}` with the
/// timestamp in Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetCorrection {
    pub endpoint_id: String,
    pub offset_ms: f64,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}
