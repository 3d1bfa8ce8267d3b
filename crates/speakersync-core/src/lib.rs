//! Speakersync Core - Click track model, detection, offset aggregation and clock sync
//!
//! This library provides the synchronous engines behind acoustic speaker
//! calibration: a deterministic click track with its expected-event schedule,
//! an onset detector for captured microphone audio, an aggregator that turns
//! detections into one robust playback offset, and a Kalman-filter clock
//! synchronizer for NTP-style time exchanges with a remote reference.

pub mod audio;
pub mod config;
pub mod result;
pub mod sync;

pub use audio::click::{ClickEvent, ClickSchedule, ClickTrackConfig, StereoTrack};
pub use audio::correlation::{cross_correlate, CorrelationResult};
pub use audio::detector::{Detection, DetectorConfig, DetectorState, OnsetDetector};
pub use audio::offset::{AggregatorConfig, MatchedPair, OffsetAggregator, OffsetReport};
pub use config::{CalibrationConfig, ConfigError, RetryPolicy, SessionTiming};
pub use result::{CalibrationResult, OffsetCorrection, PlaybackMode};
pub use sync::clock::{ClockEstimate, ClockSyncConfig, ClockSynchronizer, MeasurementOutcome, TimeExchangeSample};
pub use sync::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default sample rate for calibration audio (48kHz, what consumer speakers accept)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Source tag carried by offset corrections produced by this crate
pub const CORRECTION_SOURCE: &str = "acoustic_calibration";
