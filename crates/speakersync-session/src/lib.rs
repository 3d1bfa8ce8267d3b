//! Speakersync Session - Calibration orchestration and collaborator adapters
//!
//! Drives one acoustic calibration end to end: clock sync against the
//! reference server, capture and noise-floor measurement, the playback
//! command, onset listening and offset aggregation. Every external party
//! (reference channel, capture device, playback controller, local player,
//! result sink) sits behind an async trait so sessions can run against real
//! hardware or the in-memory [`sim`] room.

pub mod capture;
pub mod channel;
pub mod orchestrator;
pub mod playback;
pub mod sim;
pub mod sink;
pub mod time_sync;

pub use capture::{CaptureDevice, CaptureError, CaptureHandle, CpalCapture};
pub use channel::{ChannelError, MessageChannel, WsChannel};
pub use orchestrator::{
    CalibrationError, CalibrationOutcome, CalibrationRequest, CalibrationSession, Collaborators,
    SessionState,
};
pub use playback::{
    CpalPlayer, HttpPlaybackController, LocalPlayer, PlaybackController, PlaybackError, QueueMode,
};
pub use sink::{JsonLinesSink, ResultSink, SinkError};

use serde::Serialize;
use speakersync_core::{CalibrationResult, Detection, PlaybackMode};
use std::sync::Arc;
use tokio::sync::watch;

/// Capacity of the session event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Progress notifications published while a session runs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    ClockUpdate {
        offset_us: f64,
        std_dev_us: f64,
        samples: u32,
        converged: bool,
    },
    PlaybackStarted {
        mode: PlaybackMode,
        /// Session-clock time of the command (µs)
        command_time_us: i64,
        /// Same instant on the reference clock, when synced
        remote_command_time_us: Option<f64>,
    },
    /// Detection re-based to the playback command
    Detection(Detection),
    Completed(CalibrationResult),
    Cancelled,
    Failed {
        message: String,
    },
}

/// Cooperative cancellation shared between a session and its controller
///
/// Clones observe the same flag. Cancelling is idempotent and can be done
/// from any thread, including a signal handler.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// True once [`cancel`](Self::cancel) has been called on any clone
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the token
        let _ = rx.wait_for(|&cancelled| cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
