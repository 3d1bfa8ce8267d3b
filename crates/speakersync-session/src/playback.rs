//! Click track playback
//!
//! The session first asks the endpoint itself to play the hosted track
//! ([`PlaybackController`]); if that fails it plays the rendered track through
//! a local output device ([`LocalPlayer`]).

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::{Deserialize, Serialize};
use speakersync_core::StereoTrack;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Playback failures
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Playback request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint rejected playback ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Output device error: {0}")]
    Device(String),
}

/// How new media interacts with the endpoint's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Stop current playback and play immediately
    Replace,
    /// Play after the current item
    Append,
}

/// Remote control of an endpoint's player
#[async_trait]
pub trait PlaybackController: Send + Sync {
    async fn play_media(&self, target_id: &str, uri: &str, queue_mode: QueueMode) -> Result<(), PlaybackError>;
}

/// Plays a rendered track on this machine
#[async_trait]
pub trait LocalPlayer: Send {
    /// Start playback and return once audio is flowing
    async fn play(&mut self, track: &StereoTrack) -> Result<(), PlaybackError>;

    /// Stop playback; no-op when idle
    async fn stop(&mut self);
}

#[derive(Debug, Serialize)]
struct PlayMediaRequest<'a> {
    target_id: &'a str,
    uri: &'a str,
    queue_mode: QueueMode,
}

/// Posts `{target_id, uri, queue_mode}` to `<base_url>/play_media`
#[derive(Debug, Clone)]
pub struct HttpPlaybackController {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPlaybackController {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/play_media", self.base_url)
    }
}

#[async_trait]
impl PlaybackController for HttpPlaybackController {
    async fn play_media(&self, target_id: &str, uri: &str, queue_mode: QueueMode) -> Result<(), PlaybackError> {
        let response = self
            .client
            .post(self.endpoint())
            .json(&PlayMediaRequest {
                target_id,
                uri,
                queue_mode,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlaybackError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        tracing::info!(target_id, uri, ?queue_mode, "remote_playback_commanded");
        Ok(())
    }
}

struct ActivePlayback {
    stop_tx: crossbeam_channel::Sender<()>,
    thread: std::thread::JoinHandle<()>,
    finished: Arc<AtomicBool>,
}

/// Default output device via cpal
///
/// The stream lives on its own thread; the track is written to the first two
/// device channels (averaged for mono devices) and silence follows the end.
#[derive(Default)]
pub struct CpalPlayer {
    active: Option<ActivePlayback>,
}

impl CpalPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the whole track has been handed to the device
    pub fn is_finished(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.finished.load(Ordering::Relaxed))
            .unwrap_or(true)
    }
}

/// Write stereo frames into a device buffer of `channels` interleaved channels
///
/// Returns the number of source frames consumed.
pub fn fill_output(data: &mut [f32], channels: usize, left: &[f32], right: &[f32], position: usize) -> usize {
    let channels = channels.max(1);
    let mut consumed = 0;
    for (i, frame) in data.chunks_mut(channels).enumerate() {
        let idx = position + i;
        let (l, r) = match (left.get(idx), right.get(idx)) {
            (Some(&l), Some(&r)) => {
                consumed += 1;
                (l, r)
            }
            _ => (0.0, 0.0),
        };
        if channels == 1 {
            frame[0] = 0.5 * (l + r);
        } else {
            frame[0] = l;
            if let Some(slot) = frame.get_mut(1) {
                *slot = r;
            }
            for ch in frame.iter_mut().skip(2) {
                *ch = 0.0;
            }
        }
    }
    consumed
}

#[async_trait]
impl LocalPlayer for CpalPlayer {
    async fn play(&mut self, track: &StereoTrack) -> Result<(), PlaybackError> {
        self.stop().await;

        let left = track.left.clone();
        let right = track.right.clone();
        let sample_rate = track.sample_rate;
        let frames = track.frames();
        let finished = Arc::new(AtomicBool::new(false));
        let callback_finished = Arc::clone(&finished);

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), PlaybackError>>();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("speakersync-playback".into())
            .spawn(move || {
                let stream = (|| -> Result<cpal::Stream, PlaybackError> {
                    let device = cpal::default_host()
                        .default_output_device()
                        .ok_or_else(|| PlaybackError::Device("no default output device".into()))?;
                    let channels = device
                        .default_output_config()
                        .map(|c| c.channels())
                        .unwrap_or(2);
                    let config = cpal::StreamConfig {
                        channels,
                        sample_rate: cpal::SampleRate(sample_rate),
                        buffer_size: cpal::BufferSize::Default,
                    };
                    let mut position = 0usize;
                    let stream = device
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                position += fill_output(data, channels as usize, &left, &right, position);
                                if position >= left.len() {
                                    callback_finished.store(true, Ordering::Relaxed);
                                }
                            },
                            move |err| {
                                tracing::error!(error = %err, "playback_stream_error");
                            },
                            None,
                        )
                        .map_err(|e| PlaybackError::Device(e.to_string()))?;
                    stream.play().map_err(|e| PlaybackError::Device(e.to_string()))?;
                    Ok(stream)
                })();

                match stream {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| PlaybackError::Device("playback thread exited".into()))??;

        tracing::info!(frames, sample_rate, "local_playback_started");
        self.active = Some(ActivePlayback {
            stop_tx,
            thread,
            finished,
        });
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.stop_tx.send(());
            let thread = active.thread;
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
            tracing::info!("local_playback_stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_output_stereo_device() {
        let left = [0.1, 0.2, 0.3];
        let right = [-0.1, -0.2, -0.3];
        let mut data = [9.0f32; 8];
        let consumed = fill_output(&mut data, 4, &left, &right, 1);
        assert_eq!(consumed, 2);
        assert_eq!(data, [0.2, -0.2, 0.0, 0.0, 0.3, -0.3, 0.0, 0.0]);
    }

    #[test]
    fn test_fill_output_past_end_is_silent() {
        let mut data = [1.0f32; 4];
        let consumed = fill_output(&mut data, 2, &[0.5], &[0.5], 1);
        assert_eq!(consumed, 0);
        assert_eq!(data, [0.0; 4]);
    }

    #[test]
    fn test_fill_output_mono_device() {
        let mut data = [0.0f32; 2];
        fill_output(&mut data, 1, &[0.4, 0.0], &[0.2, 1.0], 0);
        assert!((data[0] - 0.3).abs() < 1e-6);
        assert!((data[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(PlayMediaRequest {
            target_id: "kitchen",
            uri: "http://host/clicks.wav",
            queue_mode: QueueMode::Replace,
        })
        .unwrap();
        assert_eq!(json["target_id"], "kitchen");
        assert_eq!(json["queue_mode"], "replace");
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let controller = HttpPlaybackController::new("http://speaker.local:8080/");
        assert_eq!(controller.endpoint(), "http://speaker.local:8080/play_media");
    }

    #[tokio::test]
    async fn test_unreachable_controller_errors() {
        // Port 9 (discard) on localhost is not expected to accept HTTP
        let controller = HttpPlaybackController::new("http://127.0.0.1:9");
        let result = controller
            .play_media("kitchen", "http://host/clicks.wav", QueueMode::Replace)
            .await;
        assert!(result.is_err());
    }
}
