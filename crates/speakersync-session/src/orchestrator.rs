//! Calibration session state machine
//!
//! One [`CalibrationSession`] runs one calibration at a time:
//!
//! ```text
//! Idle -> ClockSyncing -> Synced | SyncFailedFallback -> AudioInit
//!      -> Listening -> Completing -> Idle
//! ```
//!
//! Any active state may drop to `Idle` on cancellation or to `Error` on a
//! failure; `Error` always returns to `Idle` so the session can be reused.
//! Capture, the reference channel and local playback are released on every
//! exit path.

use crate::capture::{CaptureDevice, CaptureError, CaptureHandle};
use crate::channel::{ChannelError, MessageChannel};
use crate::playback::{LocalPlayer, PlaybackController, PlaybackError, QueueMode};
use crate::sink::{ResultSink, SinkError};
use crate::time_sync::{run_exchange, SessionClock, SyncOutcome};
use crate::{CancelToken, SessionEvent, EVENT_CHANNEL_CAPACITY};
use serde::Serialize;
use speakersync_core::audio::click::{render_track, ClickSchedule};
use speakersync_core::audio::detector::{Detection, DetectorState, OnsetDetector};
use speakersync_core::audio::offset::OffsetAggregator;
use speakersync_core::config::{CalibrationConfig, ConfigError};
use speakersync_core::sync::clock::{ClockEstimate, ClockSynchronizer};
use speakersync_core::{CalibrationResult, PlaybackMode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Phase of a calibration session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    ClockSyncing,
    Synced,
    SyncFailedFallback,
    AudioInit,
    Listening,
    Completing,
    Error,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, ClockSyncing) => true,
            (ClockSyncing, Synced | SyncFailedFallback) => true,
            (Synced | SyncFailedFallback, AudioInit) => true,
            (AudioInit, Listening) => true,
            (Listening, Completing) => true,
            (Completing, Idle) => true,
            (Error, Idle) => true,
            // Cancellation
            (ClockSyncing | Synced | SyncFailedFallback | AudioInit | Listening, Idle) => true,
            (Idle | Error, Error) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    pub fn is_active(self) -> bool {
        self != SessionState::Idle
    }
}

/// Why a session ended without a result
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Reference channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Clock did not converge within {0}ms")]
    SyncTimeout(u64),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Playback failed (remote: {remote}; local: {local})")]
    Playback {
        remote: PlaybackError,
        local: PlaybackError,
    },

    #[error("Result delivery failed: {0}")]
    Delivery(#[from] SinkError),
}

/// How a session that did not fail ended
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Completed(CalibrationResult),
    Cancelled,
}

/// Which endpoint to calibrate and where to reach it
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRequest {
    pub endpoint_id: String,
    pub endpoint_name: String,
    /// URI of the hosted click track the endpoint is told to play
    pub media_uri: String,
    /// Reference server used for clock sync
    pub reference_url: String,
}

/// External parties a session talks to
pub struct Collaborators {
    pub channel: Box<dyn MessageChannel>,
    pub capture: Box<dyn CaptureDevice>,
    pub playback: Arc<dyn PlaybackController>,
    pub local_player: Box<dyn LocalPlayer>,
    pub sink: Box<dyn ResultSink>,
}

/// Resources that must be released when a run ends
#[derive(Debug, Default)]
struct OpenResources {
    channel: bool,
    capture: Option<CaptureHandle>,
    local_playback: bool,
}

enum SyncPhase {
    Synced,
    Fallback,
    Cancelled,
}

/// Drives calibrations for one set of collaborators
pub struct CalibrationSession {
    config: CalibrationConfig,
    collaborators: Collaborators,
    synchronizer: ClockSynchronizer,
    state: SessionState,
    resources: OpenResources,
    events: broadcast::Sender<SessionEvent>,
}

impl CalibrationSession {
    pub fn new(config: CalibrationConfig, collaborators: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let synchronizer = ClockSynchronizer::new(config.clock.clone());
        Self {
            config,
            collaborators,
            synchronizer,
            state: SessionState::Idle,
            resources: OpenResources::default(),
            events,
        }
    }

    /// Receive progress events for subsequent runs
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Clock estimate from the most recent sync attempt
    pub fn clock_estimate(&self) -> ClockEstimate {
        self.synchronizer.estimate()
    }

    /// Run one calibration to completion, cancellation or failure
    ///
    /// The session is back in `Idle` when this returns, whatever the outcome.
    pub async fn run(
        &mut self,
        request: &CalibrationRequest,
        cancel: &CancelToken,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        if self.state.is_active() {
            // A previous run future was dropped mid-flight
            tracing::warn!(state = ?self.state, "session_recovering_abandoned_run");
            self.release().await;
            self.set_state(SessionState::Idle);
        }
        self.config.validate()?;

        let config = self.config.clone();
        self.synchronizer.reset();
        let clock = SessionClock::start();

        tracing::info!(
            endpoint_id = %request.endpoint_id,
            endpoint_name = %request.endpoint_name,
            clicks = config.click.num_clicks(),
            "calibration_started"
        );

        let outcome = self.drive(&config, request, cancel, &clock).await;
        self.release().await;

        match outcome {
            Ok(Some(result)) => {
                let correction = result.to_correction();
                if let Err(e) = self.collaborators.sink.deliver(&result, &correction).await {
                    return Err(self.fail(e.into()));
                }
                self.transition(SessionState::Idle)?;
                tracing::info!(
                    endpoint_id = %result.endpoint_id,
                    offset_ms = %format!("{:.2}", result.offset_ms),
                    confidence = %format!("{:.2}", result.confidence),
                    detected = result.detected_count,
                    expected = result.total_expected,
                    clock_synced = result.clock_synced,
                    "calibration_completed"
                );
                let _ = self.events.send(SessionEvent::Completed(result.clone()));
                Ok(CalibrationOutcome::Completed(result))
            }
            Ok(None) => {
                self.set_state(SessionState::Idle);
                tracing::info!(endpoint_id = %request.endpoint_id, "calibration_cancelled");
                let _ = self.events.send(SessionEvent::Cancelled);
                Ok(CalibrationOutcome::Cancelled)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// The session proper; `Ok(None)` means cancelled
    async fn drive(
        &mut self,
        config: &CalibrationConfig,
        request: &CalibrationRequest,
        cancel: &CancelToken,
        clock: &SessionClock,
    ) -> Result<Option<CalibrationResult>, CalibrationError> {
        self.transition(SessionState::ClockSyncing)?;
        let clock_synced = match self.sync_clock(config, request, cancel, clock).await? {
            SyncPhase::Cancelled => return Ok(None),
            SyncPhase::Synced => {
                self.transition(SessionState::Synced)?;
                true
            }
            SyncPhase::Fallback => {
                self.transition(SessionState::SyncFailedFallback)?;
                false
            }
        };

        self.transition(SessionState::AudioInit)?;
        let handle = self
            .collaborators
            .capture
            .open(config.click.sample_rate, config.session.capture_channels)
            .await?;
        self.resources.capture = Some(handle.clone());
        if handle.sample_rate() != config.click.sample_rate {
            tracing::warn!(
                requested = config.click.sample_rate,
                actual = handle.sample_rate(),
                "capture_sample_rate_mismatch"
            );
        }

        let schedule = ClickSchedule::generate(&config.click);
        let mut detector = OnsetDetector::new(
            handle.sample_rate(),
            config.detector.clone(),
            config.click.frequencies.clone(),
        );
        detector.start();

        let mut ticker = interval(Duration::from_millis(config.session.capture_poll_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if !self
            .capture_noise_floor(config, &handle, &mut detector, &mut ticker, cancel)
            .await?
        {
            return Ok(None);
        }

        // Drain the backlog so received samples line up with the command instant
        let backlog = self.collaborators.capture.read_chunk(&handle).await?;
        let early = detector.push_samples(&backlog);
        if !early.is_empty() {
            tracing::debug!(count = early.len(), "pre_playback_detections_discarded");
        }
        let command_ms = detector.received_ms();
        let command_time_us = clock.now_us();

        let mode = self.start_playback(config, request).await?;
        let remote_command_time_us =
            clock_synced.then(|| self.synchronizer.local_to_remote_time(command_time_us as f64));
        tracing::info!(
            mode = ?mode,
            command_ms = %format!("{:.1}", command_ms),
            command_time_us,
            "playback_started"
        );
        let _ = self.events.send(SessionEvent::PlaybackStarted {
            mode,
            command_time_us,
            remote_command_time_us,
        });

        self.transition(SessionState::Listening)?;
        let Some(detections) = self
            .listen(config, &handle, &mut detector, &mut ticker, &schedule, command_ms, cancel)
            .await?
        else {
            return Ok(None);
        };

        self.transition(SessionState::Completing)?;
        let report = OffsetAggregator::new(config.aggregator.clone())
            .calculate_average_offset(&detections, &schedule);

        Ok(Some(CalibrationResult::from_report(
            &request.endpoint_id,
            &request.endpoint_name,
            &report,
            detections.len(),
            schedule.len(),
            clock_synced,
            mode,
        )))
    }

    async fn sync_clock(
        &mut self,
        config: &CalibrationConfig,
        request: &CalibrationRequest,
        cancel: &CancelToken,
        clock: &SessionClock,
    ) -> Result<SyncPhase, CalibrationError> {
        let timing = &config.session;

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SyncPhase::Cancelled),
            result = self.collaborators.channel.connect(&request.reference_url) => result,
        };
        if let Err(e) = connected {
            if timing.allow_unsynced_fallback {
                tracing::warn!(error = %e, "clock_sync_unavailable_continuing_unsynced");
                return Ok(SyncPhase::Fallback);
            }
            return Err(e.into());
        }
        self.resources.channel = true;

        let outcome = run_exchange(
            self.collaborators.channel.as_mut(),
            &mut self.synchronizer,
            timing,
            clock,
            cancel,
            &self.events,
        )
        .await;
        self.collaborators.channel.close().await;
        self.resources.channel = false;

        match outcome {
            Ok(SyncOutcome::Converged(_)) => Ok(SyncPhase::Synced),
            Ok(SyncOutcome::Cancelled) => Ok(SyncPhase::Cancelled),
            Ok(SyncOutcome::TimedOut(_)) if timing.allow_unsynced_fallback => {
                tracing::warn!("clock_sync_timed_out_continuing_unsynced");
                Ok(SyncPhase::Fallback)
            }
            Ok(SyncOutcome::TimedOut(_)) => Err(CalibrationError::SyncTimeout(timing.sync_timeout_ms)),
            Err(e) if timing.allow_unsynced_fallback => {
                tracing::warn!(error = %e, "clock_sync_failed_continuing_unsynced");
                Ok(SyncPhase::Fallback)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Feed capture into the detector until the noise floor is known
    ///
    /// Returns `false` when cancelled. Fails with `Stalled` if the device
    /// delivers too little audio to finish within the startup slack.
    async fn capture_noise_floor(
        &mut self,
        config: &CalibrationConfig,
        handle: &CaptureHandle,
        detector: &mut OnsetDetector,
        ticker: &mut Interval,
        cancel: &CancelToken,
    ) -> Result<bool, CalibrationError> {
        let waited_ms = config.detector.noise_floor_ms.max(0.0) as u64 + config.session.startup_slack_ms;
        let deadline = tokio::time::sleep(Duration::from_millis(waited_ms));
        tokio::pin!(deadline);

        while detector.state() == DetectorState::CapturingNoiseFloor {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(false),
                _ = &mut deadline => return Err(CaptureError::Stalled { waited_ms }.into()),
                _ = ticker.tick() => {
                    let chunk = self.collaborators.capture.read_chunk(handle).await?;
                    let early = detector.push_samples(&chunk);
                    if !early.is_empty() {
                        tracing::debug!(count = early.len(), "pre_playback_detections_discarded");
                    }
                }
            }
        }
        Ok(true)
    }

    /// Command remote playback, falling back to the local player
    async fn start_playback(
        &mut self,
        config: &CalibrationConfig,
        request: &CalibrationRequest,
    ) -> Result<PlaybackMode, CalibrationError> {
        let remote = match self
            .collaborators
            .playback
            .play_media(&request.endpoint_id, &request.media_uri, QueueMode::Replace)
            .await
        {
            Ok(()) => return Ok(PlaybackMode::Remote),
            Err(e) => e,
        };
        tracing::warn!(error = %remote, "remote_playback_failed_using_local");

        let track = render_track(&config.click);
        match self.collaborators.local_player.play(&track).await {
            Ok(()) => {
                self.resources.local_playback = true;
                Ok(PlaybackMode::LocalFallback)
            }
            Err(local) => Err(CalibrationError::Playback { remote, local }),
        }
    }

    /// Collect detections until every click is heard or the window closes
    ///
    /// Timestamps are re-based to the playback command. Returns `None` when
    /// cancelled; nothing read after cancellation is kept.
    #[allow(clippy::too_many_arguments)]
    async fn listen(
        &mut self,
        config: &CalibrationConfig,
        handle: &CaptureHandle,
        detector: &mut OnsetDetector,
        ticker: &mut Interval,
        schedule: &ClickSchedule,
        command_ms: f64,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<Detection>>, CalibrationError> {
        let window_ms = config.click.total_duration_ms().max(0.0) as u64 + config.session.startup_slack_ms;
        let deadline = tokio::time::sleep(Duration::from_millis(window_ms));
        tokio::pin!(deadline);

        let mut detections = Vec::with_capacity(schedule.len());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    detector.stop();
                    return Ok(None);
                }
                _ = &mut deadline => {
                    tracing::info!(
                        detected = detections.len(),
                        expected = schedule.len(),
                        window_ms,
                        "listen_window_closed"
                    );
                    break;
                }
                _ = ticker.tick() => {
                    let chunk = self.collaborators.capture.read_chunk(handle).await?;
                    for detection in detector.push_samples(&chunk) {
                        let rebased = Detection {
                            timestamp_ms: detection.timestamp_ms - command_ms,
                            ..detection
                        };
                        let _ = self.events.send(SessionEvent::Detection(rebased));
                        detections.push(rebased);
                    }
                    if detections.len() >= schedule.len() {
                        tracing::debug!(detected = detections.len(), "all_clicks_heard");
                        break;
                    }
                }
            }
        }
        detector.stop();
        Ok(Some(detections))
    }

    async fn release(&mut self) {
        if let Some(handle) = self.resources.capture.take() {
            self.collaborators.capture.close(handle).await;
        }
        if std::mem::take(&mut self.resources.channel) {
            self.collaborators.channel.close().await;
        }
        if std::mem::take(&mut self.resources.local_playback) {
            self.collaborators.local_player.stop().await;
        }
    }

    /// Record a failure: pass through `Error`, publish it and return to `Idle`
    fn fail(&mut self, error: CalibrationError) -> CalibrationError {
        if self.state.can_transition_to(SessionState::Error) {
            self.set_state(SessionState::Error);
        }
        tracing::error!(error = %error, "calibration_failed");
        let _ = self.events.send(SessionEvent::Failed {
            message: error.to_string(),
        });
        self.set_state(SessionState::Idle);
        error
    }

    fn transition(&mut self, next: SessionState) -> Result<(), CalibrationError> {
        if !self.state.can_transition_to(next) {
            return Err(CalibrationError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.set_state(next);
        Ok(())
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        let from = self.state;
        self.state = next;
        tracing::debug!(from = ?from, to = ?next, "session_state_changed");
        let _ = self.events.send(SessionEvent::StateChanged { from, to: next });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MemorySink, SimReferenceChannel, SimulatedRoom};
    use tokio::time::Instant;

    fn config() -> CalibrationConfig {
        let mut config = CalibrationConfig::default();
        config.click.total_duration_sec = 6.0;
        config.session.sync_timeout_ms = 1_000;
        config.session.startup_slack_ms = 1_000;
        config
    }

    fn request() -> CalibrationRequest {
        CalibrationRequest {
            endpoint_id: "kitchen".into(),
            endpoint_name: "Kitchen".into(),
            media_uri: "http://host/clicks.wav".into(),
            reference_url: "sim://reference".into(),
        }
    }

    fn session(
        config: CalibrationConfig,
        room: &SimulatedRoom,
        channel: SimReferenceChannel,
        sink: &MemorySink,
    ) -> CalibrationSession {
        CalibrationSession::new(
            config,
            Collaborators {
                channel: Box::new(channel),
                capture: Box::new(room.capture()),
                playback: Arc::new(room.controller()),
                local_player: Box::new(room.local_player()),
                sink: Box::new(sink.clone()),
            },
        )
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[SessionEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn completed(outcome: CalibrationOutcome) -> CalibrationResult {
        match outcome {
            CalibrationOutcome::Completed(result) => result,
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(Idle.can_transition_to(ClockSyncing));
        assert!(ClockSyncing.can_transition_to(Synced));
        assert!(ClockSyncing.can_transition_to(SyncFailedFallback));
        assert!(SyncFailedFallback.can_transition_to(AudioInit));
        assert!(AudioInit.can_transition_to(Listening));
        assert!(Listening.can_transition_to(Completing));
        assert!(Completing.can_transition_to(Idle));
        assert!(Listening.can_transition_to(Idle));
        assert!(AudioInit.can_transition_to(Error));
        assert!(Error.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Listening));
        assert!(!Idle.can_transition_to(Error));
        assert!(!Synced.can_transition_to(Listening));
        assert!(!Completing.can_transition_to(Listening));
        assert!(!Error.can_transition_to(ClockSyncing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_with_remote_playback() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 25.0).with_noise(0.002);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(-40_000), &sink);
        let mut rx = session.subscribe();

        let outcome = session.run(&request(), &CancelToken::new()).await.unwrap();
        let result = completed(outcome);

        assert_eq!(result.endpoint_id, "kitchen");
        assert_eq!(result.total_expected, 6);
        assert_eq!(result.detected_count, 6);
        assert_eq!(result.matched_count, 6);
        // Onset refinement lands within a couple of 64-sample blocks
        assert!(
            (result.offset_ms - 25.0).abs() < 5.0,
            "offset {}",
            result.offset_ms
        );
        assert!(result.confidence > 0.9);
        assert!(result.clock_synced);
        assert_eq!(result.playback, PlaybackMode::Remote);
        assert!((session.clock_estimate().offset_us + 40_000.0).abs() < 1.0);

        assert_eq!(session.state(), SessionState::Idle);
        assert!(!room.is_capture_open());
        assert_eq!(
            room.remote_commands(),
            vec![(
                "kitchen".to_string(),
                "http://host/clicks.wav".to_string(),
                QueueMode::Replace
            )]
        );

        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].1.endpoint_id, "kitchen");
        assert_eq!(deliveries[0].1.offset_ms, result.offset_ms);

        let events = drain(&mut rx);
        use SessionState::*;
        assert_eq!(
            states(&events),
            vec![ClockSyncing, Synced, AudioInit, Listening, Completing, Idle]
        );
        let detections = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Detection(_)))
            .count();
        assert_eq!(detections, 6);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::PlaybackStarted {
                mode: PlaybackMode::Remote,
                remote_command_time_us: Some(_),
                ..
            }
        )));
        assert!(matches!(events.last(), Some(SessionEvent::Completed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_listening_once_all_clicks_heard() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 10.0);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);

        let start = Instant::now();
        completed(session.run(&request(), &CancelToken::new()).await.unwrap());
        // Last click starts 5s after the command; the window would run to 7s
        assert!(start.elapsed() < Duration::from_millis(6_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_local_playback() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 15.0).remote_unavailable();
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);

        let result = completed(session.run(&request(), &CancelToken::new()).await.unwrap());
        assert_eq!(result.playback, PlaybackMode::LocalFallback);
        assert_eq!(result.detected_count, 6);
        assert!((result.offset_ms - 15.0).abs() < 5.0);
        assert_eq!(room.remote_commands().len(), 1);
        assert!(!room.is_local_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_playback_paths_failing_is_an_error() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 0.0)
            .remote_unavailable()
            .local_unavailable();
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);
        let mut rx = session.subscribe();

        let err = session.run(&request(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Playback { .. }));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!room.is_capture_open());
        assert!(sink.deliveries().is_empty());

        let events = drain(&mut rx);
        let states = states(&events);
        assert_eq!(&states[states.len() - 2..], &[SessionState::Error, SessionState::Idle]);
        assert!(events.iter().any(|e| matches!(e, SessionEvent::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_reference_continues_unsynced() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 20.0);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::unreachable(), &sink);
        let mut rx = session.subscribe();

        let result = completed(session.run(&request(), &CancelToken::new()).await.unwrap());
        assert!(!result.clock_synced);
        assert!((result.offset_ms - 20.0).abs() < 5.0);

        let events = drain(&mut rx);
        assert!(states(&events).contains(&SessionState::SyncFailedFallback));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::PlaybackStarted {
                remote_command_time_us: None,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_reference_without_fallback_fails() {
        let mut config = config();
        config.session.allow_unsynced_fallback = false;
        let room = SimulatedRoom::new(&config.click, 0.0);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::unreachable(), &sink);

        let err = session.run(&request(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Channel(ChannelError::Connect { .. })));
        assert!(room.playback_start_frame().is_none());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_timeout_without_fallback_fails() {
        let mut config = config();
        config.session.allow_unsynced_fallback = false;
        let room = SimulatedRoom::new(&config.click, 0.0);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::silent(), &sink);

        let err = session.run(&request(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, CalibrationError::SyncTimeout(1_000)));
        assert!(!room.is_capture_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_unavailable_fails() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 0.0).capture_unavailable();
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);

        let err = session.run(&request(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Capture(CaptureError::Unavailable(_))));
        assert!(room.remote_commands().is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_listening() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 0.0);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);
        let mut rx = session.subscribe();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            trigger.cancel();
        });

        let outcome = session.run(&request(), &cancel).await.unwrap();
        assert_eq!(outcome, CalibrationOutcome::Cancelled);
        assert!(!room.is_capture_open());
        assert!(sink.deliveries().is_empty());

        let events = drain(&mut rx);
        assert!(events.contains(&SessionEvent::StateChanged {
            from: SessionState::Listening,
            to: SessionState::Idle,
        }));
        assert_eq!(events.last(), Some(&SessionEvent::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 0.0);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = session.run(&request(), &cancel).await.unwrap();
        assert_eq!(outcome, CalibrationOutcome::Cancelled);
        assert!(room.remote_commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_room_gives_low_confidence_result() {
        let config = config();
        // Speaker never reaches the microphone within the listen window
        let room = SimulatedRoom::new(&config.click, 60_000.0).with_noise(0.002);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);

        let result = completed(session.run(&request(), &CancelToken::new()).await.unwrap());
        assert_eq!(result.detected_count, 0);
        assert_eq!(result.offset_ms, 0.0);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(sink.deliveries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_is_an_error() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 5.0);
        let sink = MemorySink::failing();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);

        let err = session.run(&request(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Delivery(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected_before_any_io() {
        let mut config = config();
        config.click.frequencies.clear();
        let room = SimulatedRoom::new(&config.click, 0.0);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);

        let err = session.run(&request(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Config(ConfigError::NoFrequencies)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_is_reusable() {
        let config = config();
        let room = SimulatedRoom::new(&config.click, 12.0);
        let sink = MemorySink::new();
        let mut session = session(config, &room, SimReferenceChannel::new(0), &sink);

        let mut applied = Vec::new();
        for _ in 0..2 {
            let result = completed(session.run(&request(), &CancelToken::new()).await.unwrap());
            assert!((result.offset_ms - 12.0).abs() < 5.0);
            applied.push(session.clock_estimate().sample_count);
        }
        assert_eq!(sink.deliveries().len(), 2);
        // Each run starts the filter from priors
        assert!(applied[0] > 0);
        assert_eq!(applied[0], applied[1], "Samples carried over between runs");
    }
}
