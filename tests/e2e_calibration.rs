//! E2E tests for complete calibration sessions
//!
//! Runs the orchestrator against the simulated room under paused tokio time:
//! clock sync, noise floor, the playback command, listening, aggregation and
//! delivery of the correction.

use speakersync::session::sim::{MemorySink, SimReferenceChannel, SimulatedRoom};
use speakersync::session::JsonLinesSink;
use speakersync::{
    CalibrationConfig, CalibrationOutcome, CalibrationRequest, CalibrationResult,
    CalibrationSession, CancelToken, Collaborators, PlaybackMode, SessionState,
};
use std::sync::Arc;
use std::time::Duration;

fn config(seconds: f64) -> CalibrationConfig {
    let mut config = CalibrationConfig::default();
    config.click.total_duration_sec = seconds;
    config.session.startup_slack_ms = 1_000;
    config
}

fn request(id: &str) -> CalibrationRequest {
    CalibrationRequest {
        endpoint_id: id.to_string(),
        endpoint_name: format!("Speaker {}", id),
        media_uri: "http://host/clicks.wav".into(),
        reference_url: "sim://reference".into(),
    }
}

fn sim_session(config: CalibrationConfig, room: &SimulatedRoom, sink: MemorySink) -> CalibrationSession {
    CalibrationSession::new(
        config,
        Collaborators {
            channel: Box::new(SimReferenceChannel::new(15_000)),
            capture: Box::new(room.capture()),
            playback: Arc::new(room.controller()),
            local_player: Box::new(room.local_player()),
            sink: Box::new(sink),
        },
    )
}

async fn calibrate(config: CalibrationConfig, delay_ms: f64, noise: f32) -> CalibrationResult {
    let room = SimulatedRoom::new(&config.click, delay_ms).with_noise(noise);
    let mut session = sim_session(config, &room, MemorySink::new());
    match session.run(&request("den"), &CancelToken::new()).await.unwrap() {
        CalibrationOutcome::Completed(result) => result,
        other => panic!("Expected completion, got {:?}", other),
    }
}

// ============================================================================
// OFFSET ACCURACY
// ============================================================================

/// Speaker delay is recovered within a few milliseconds
#[tokio::test(start_paused = true)]
async fn test_recovers_speaker_delay() {
    let result = calibrate(config(8.0), 42.5, 0.002).await;

    assert_eq!(result.total_expected, 8);
    assert_eq!(result.detected_count, 8);
    assert!(
        (result.offset_ms - 42.5).abs() < 5.0,
        "Offset should be ~42.5ms, got {}ms",
        result.offset_ms
    );
    assert!(result.confidence > 0.9);
    assert!(result.clock_synced);
    assert_eq!(result.playback, PlaybackMode::Remote);
}

/// Default 20-click track at 48kHz with a 10ms speaker delay
#[tokio::test(start_paused = true)]
async fn test_default_track_ten_ms_delay() {
    let result = calibrate(CalibrationConfig::default(), 10.0, 0.001).await;

    assert_eq!(result.total_expected, 20);
    assert_eq!(result.detected_count, 20);
    assert!(
        (result.offset_ms - 10.0).abs() < 5.0,
        "Offset should be ~10ms, got {}ms",
        result.offset_ms
    );
    assert!(result.confidence > 0.9);
    assert!((result.detection_rate() - 1.0).abs() < 1e-9);
}

/// Differences between speakers are measured more tightly than absolutes
#[tokio::test(start_paused = true)]
async fn test_relative_offsets_between_speakers() {
    let near = calibrate(config(6.0), 0.0, 0.0).await;
    let far = calibrate(config(6.0), 37.0, 0.0).await;

    let difference = far.offset_ms - near.offset_ms;
    assert!(
        (difference - 37.0).abs() < 1.5,
        "Relative offset should be ~37ms, got {}ms",
        difference
    );
}

/// Loud background noise raises the threshold but clicks still register
#[tokio::test(start_paused = true)]
async fn test_noisy_room() {
    let result = calibrate(config(6.0), 20.0, 0.02).await;

    assert!(result.detected_count >= 5, "Detected {}", result.detected_count);
    assert!((result.offset_ms - 20.0).abs() < 8.0, "Offset {}", result.offset_ms);
}

// ============================================================================
// DELIVERY AND CONFIGURATION
// ============================================================================

/// The correction lands in the JSON-lines file in its wire shape
#[tokio::test(start_paused = true)]
async fn test_correction_written_as_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrections.jsonl");

    let config = config(4.0);
    let room = SimulatedRoom::new(&config.click, 12.0);
    let mut session = CalibrationSession::new(
        config,
        Collaborators {
            channel: Box::new(SimReferenceChannel::new(0)),
            capture: Box::new(room.capture()),
            playback: Arc::new(room.controller()),
            local_player: Box::new(room.local_player()),
            sink: Box::new(JsonLinesSink::file(&path).unwrap()),
        },
    );
    session.run(&request("hall"), &CancelToken::new()).await.unwrap();
    drop(session);

    let contents = std::fs::read_to_string(&path).unwrap();
    let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    let correction = &line["correction"];
    assert_eq!(correction["endpointId"], "hall");
    assert_eq!(correction["source"], "acoustic_calibration");
    assert!(correction["timestamp"].as_i64().unwrap() > 0);
    let offset = correction["offsetMs"].as_f64().unwrap();
    assert!((offset - 12.0).abs() < 5.0);
    assert_eq!(line["result"]["total_expected"], 4);
}

/// A saved config file drives the session
#[tokio::test(start_paused = true)]
async fn test_session_uses_saved_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("speakersync").join("config.json");

    let mut saved = config(5.0);
    saved.click.click_interval_ms = 500.0;
    saved.save(&path).unwrap();

    let loaded = CalibrationConfig::load(&path);
    assert_eq!(loaded, saved);

    let result = calibrate(loaded, 8.0, 0.0).await;
    assert_eq!(result.total_expected, 10);
    assert_eq!(result.detected_count, 10);
    assert!((result.offset_ms - 8.0).abs() < 5.0);
}

// ============================================================================
// LIFECYCLE
// ============================================================================

/// A run abandoned mid-flight is cleaned up by the next one
#[tokio::test(start_paused = true)]
async fn test_recovers_from_abandoned_run() {
    let config = config(4.0);
    let room = SimulatedRoom::new(&config.click, 10.0);
    let sink = MemorySink::new();
    let mut session = sim_session(config, &room, sink.clone());

    let abandoned = tokio::time::timeout(
        Duration::from_millis(400),
        session.run(&request("loft"), &CancelToken::new()),
    )
    .await;
    assert!(abandoned.is_err(), "Run should still be measuring the noise floor");
    assert_eq!(session.state(), SessionState::AudioInit);
    assert!(room.is_capture_open());

    let outcome = session.run(&request("loft"), &CancelToken::new()).await.unwrap();
    assert!(matches!(outcome, CalibrationOutcome::Completed(_)));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!room.is_capture_open());
    assert_eq!(sink.deliveries().len(), 1);
}
