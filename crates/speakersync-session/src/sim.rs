//! In-memory room for dry runs and tests
//!
//! A [`SimulatedRoom`] ties together a fake speaker and a fake microphone: once
//! playback is commanded, the microphone hears the click track after the
//! configured speaker delay, on top of optional background noise. A
//! [`SimReferenceChannel`] answers time requests as a zero-latency reference
//! server running at a fixed offset.

use crate::capture::{CaptureDevice, CaptureError, CaptureHandle};
use crate::channel::{ChannelError, MessageChannel};
use crate::playback::{LocalPlayer, PlaybackController, PlaybackError, QueueMode};
use crate::sink::{ResultSink, SinkError};
use async_trait::async_trait;
use speakersync_core::audio::click::{render_track, ClickTrackConfig, StereoTrack};
use speakersync_core::sync::protocol::{ClientMessage, ServerHello, ServerMessage, ServerTime};
use speakersync_core::{CalibrationResult, OffsetCorrection};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Reference server answering from inside the process
pub struct SimReferenceChannel {
    offset_us: Option<i64>,
    reachable: bool,
    garbage_every: Option<u32>,
    connected: bool,
    requests: u32,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl SimReferenceChannel {
    /// Server whose clock runs `offset_us` ahead of ours
    pub fn new(offset_us: i64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            offset_us: Some(offset_us),
            reachable: true,
            garbage_every: None,
            connected: false,
            requests: 0,
            tx,
            rx,
        }
    }

    /// Server that accepts the connection but never answers time requests
    pub fn silent() -> Self {
        Self {
            offset_us: None,
            ..Self::new(0)
        }
    }

    /// Server that refuses connections
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new(0)
        }
    }

    /// Replace every `n`th reply with an unparseable frame
    pub fn with_garbage_every(mut self, n: u32) -> Self {
        self.garbage_every = Some(n.max(1));
        self
    }

    /// Time requests received so far
    pub fn requests_received(&self) -> u32 {
        self.requests
    }
}

#[async_trait]
impl MessageChannel for SimReferenceChannel {
    async fn connect(&mut self, url: &str) -> Result<(), ChannelError> {
        if !self.reachable {
            return Err(ChannelError::Connect {
                url: url.to_string(),
                attempts: 1,
                reason: "connection refused".into(),
            });
        }
        self.connected = true;
        let hello = ServerMessage::Hello(ServerHello {
            server_id: Some("sim-reference".into()),
            version: None,
        });
        let _ = self.tx.send(hello.to_json()?);
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ChannelError> {
        if !self.connected {
            return Err(ChannelError::NotConnected);
        }
        self.requests += 1;
        let Some(offset_us) = self.offset_us else {
            return Ok(());
        };
        if self.garbage_every.is_some_and(|n| self.requests % n == 0) {
            let _ = self.tx.send("{\"type\":".to_string());
            return Ok(());
        }

        let ClientMessage::Time(request) = message;
        let server_time = request.client_transmitted + offset_us;
        let reply = ServerMessage::Time(ServerTime {
            client_transmitted: request.client_transmitted,
            server_received: server_time,
            server_transmitted: server_time,
        });
        let _ = self.tx.send(reply.to_json()?);
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<ServerMessage, ChannelError>> {
        if !self.connected {
            return None;
        }
        let text = self.rx.recv().await?;
        Some(ServerMessage::parse(&text).map_err(ChannelError::from))
    }

    async fn close(&mut self) {
        self.connected = false;
        while self.rx.try_recv().is_ok() {}
    }
}

struct RoomState {
    click: ClickTrackConfig,
    speaker_output: Vec<f32>,
    delay_frames: u64,
    noise_level: f32,
    noise_state: u32,
    read_frames: usize,
    frames_emitted: u64,
    playback_start: Option<u64>,
    remote_available: bool,
    local_available: bool,
    capture_available: bool,
    capture_open: bool,
    local_playing: bool,
    remote_commands: Vec<(String, String, QueueMode)>,
}

impl RoomState {
    fn next_noise(&mut self) -> f32 {
        self.noise_state ^= self.noise_state << 13;
        self.noise_state ^= self.noise_state >> 17;
        self.noise_state ^= self.noise_state << 5;
        (self.noise_state as f32 / u32::MAX as f32 * 2.0 - 1.0) * self.noise_level
    }

    fn start_playback(&mut self, output: Vec<f32>) {
        self.speaker_output = output;
        self.playback_start = Some(self.frames_emitted);
    }

    fn render_frames(&mut self, count: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let frame = self.frames_emitted;
            let mut sample = if self.noise_level > 0.0 { self.next_noise() } else { 0.0 };
            if let Some(start) = self.playback_start {
                let heard_from = start + self.delay_frames;
                if frame >= heard_from {
                    if let Some(&s) = self.speaker_output.get((frame - heard_from) as usize) {
                        sample += s;
                    }
                }
            }
            out.push(sample);
            self.frames_emitted += 1;
        }
        out
    }
}

/// Shared speaker + microphone model
#[derive(Clone)]
pub struct SimulatedRoom {
    state: Arc<Mutex<RoomState>>,
}

impl SimulatedRoom {
    /// Room whose speaker starts sounding `speaker_delay_ms` after a play command
    pub fn new(click: &ClickTrackConfig, speaker_delay_ms: f64) -> Self {
        let sample_rate = click.sample_rate as f64;
        let delay_frames = (speaker_delay_ms.max(0.0) / 1000.0 * sample_rate).round() as u64;
        Self {
            state: Arc::new(Mutex::new(RoomState {
                click: click.clone(),
                speaker_output: Vec::new(),
                delay_frames,
                noise_level: 0.0,
                noise_state: 0x2545_F491,
                // 10ms per read
                read_frames: (click.sample_rate / 100).max(1) as usize,
                frames_emitted: 0,
                playback_start: None,
                remote_available: true,
                local_available: true,
                capture_available: true,
                capture_open: false,
                local_playing: false,
                remote_commands: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add uniform background noise of this peak level
    pub fn with_noise(self, level: f32) -> Self {
        self.lock().noise_level = level.max(0.0);
        self
    }

    /// Frames delivered per capture read
    pub fn with_read_frames(self, frames: usize) -> Self {
        self.lock().read_frames = frames.max(1);
        self
    }

    /// Make the endpoint reject remote play commands
    pub fn remote_unavailable(self) -> Self {
        self.lock().remote_available = false;
        self
    }

    /// Make the local output device fail
    pub fn local_unavailable(self) -> Self {
        self.lock().local_available = false;
        self
    }

    /// Make the microphone fail to open
    pub fn capture_unavailable(self) -> Self {
        self.lock().capture_available = false;
        self
    }

    pub fn capture(&self) -> SimCapture {
        SimCapture { room: self.clone() }
    }

    pub fn controller(&self) -> SimPlaybackController {
        SimPlaybackController { room: self.clone() }
    }

    pub fn local_player(&self) -> SimLocalPlayer {
        SimLocalPlayer { room: self.clone() }
    }

    pub fn is_capture_open(&self) -> bool {
        self.lock().capture_open
    }

    pub fn is_local_playing(&self) -> bool {
        self.lock().local_playing
    }

    /// `(target_id, uri, queue_mode)` of every remote play command
    pub fn remote_commands(&self) -> Vec<(String, String, QueueMode)> {
        self.lock().remote_commands.clone()
    }

    /// Capture frame at which playback was commanded
    pub fn playback_start_frame(&self) -> Option<u64> {
        self.lock().playback_start
    }
}

/// Microphone half of a [`SimulatedRoom`]
pub struct SimCapture {
    room: SimulatedRoom,
}

#[async_trait]
impl CaptureDevice for SimCapture {
    async fn open(&mut self, sample_rate: u32, channels: u16) -> Result<CaptureHandle, CaptureError> {
        let mut state = self.room.lock();
        if !state.capture_available {
            return Err(CaptureError::Unavailable("simulated microphone disabled".into()));
        }
        state.capture_open = true;
        Ok(CaptureHandle::new(1, sample_rate, channels))
    }

    async fn read_chunk(&mut self, _handle: &CaptureHandle) -> Result<Vec<f32>, CaptureError> {
        let mut state = self.room.lock();
        if !state.capture_open {
            return Err(CaptureError::NotOpen);
        }
        let frames = state.read_frames;
        Ok(state.render_frames(frames))
    }

    async fn close(&mut self, _handle: CaptureHandle) {
        self.room.lock().capture_open = false;
    }
}

/// Remote-control half of a [`SimulatedRoom`]
pub struct SimPlaybackController {
    room: SimulatedRoom,
}

#[async_trait]
impl PlaybackController for SimPlaybackController {
    async fn play_media(&self, target_id: &str, uri: &str, queue_mode: QueueMode) -> Result<(), PlaybackError> {
        let mut state = self.room.lock();
        state
            .remote_commands
            .push((target_id.to_string(), uri.to_string(), queue_mode));
        if !state.remote_available {
            return Err(PlaybackError::Rejected {
                status: 503,
                body: "endpoint offline".into(),
            });
        }
        let track = render_track(&state.click);
        state.start_playback(track.left);
        Ok(())
    }
}

/// Local-output half of a [`SimulatedRoom`]
pub struct SimLocalPlayer {
    room: SimulatedRoom,
}

#[async_trait]
impl LocalPlayer for SimLocalPlayer {
    async fn play(&mut self, track: &StereoTrack) -> Result<(), PlaybackError> {
        let mut state = self.room.lock();
        if !state.local_available {
            return Err(PlaybackError::Device("simulated output disabled".into()));
        }
        state.local_playing = true;
        state.start_playback(track.left.clone());
        Ok(())
    }

    async fn stop(&mut self) {
        self.room.lock().local_playing = false;
    }
}

/// Sink that keeps deliveries in memory; clones share the same store
#[derive(Clone, Default)]
pub struct MemorySink {
    deliveries: Arc<Mutex<Vec<(CalibrationResult, OffsetCorrection)>>>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose every delivery fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn deliveries(&self) -> Vec<(CalibrationResult, OffsetCorrection)> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn deliver(&mut self, result: &CalibrationResult, correction: &OffsetCorrection) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated sink failure",
            )));
        }
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((result.clone(), correction.clone()));
        Ok(())
    }
}
