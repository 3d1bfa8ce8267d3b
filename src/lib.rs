//! Speakersync - acoustic playback-delay calibration for networked speakers
//!
//! This library re-exports the sync engines from `speakersync-core` and the
//! session orchestrator with its device and network adapters from
//! `speakersync-session`.

pub use speakersync_core::{audio, config, result, sync};
pub use speakersync_session as session;

pub use speakersync_core::{
    cross_correlate, CalibrationConfig, CalibrationResult, ClickSchedule, ClickTrackConfig,
    ClockSynchronizer, Detection, OffsetAggregator, OffsetCorrection, OnsetDetector, PlaybackMode,
};
pub use speakersync_core::{BUILD_DATE, DEFAULT_SAMPLE_RATE, VERSION};
pub use speakersync_session::{
    CalibrationError, CalibrationOutcome, CalibrationRequest, CalibrationSession, CancelToken,
    Collaborators, SessionEvent, SessionState,
};
