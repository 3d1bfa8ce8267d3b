//! Microphone capture
//!
//! [`CpalCapture`] owns its cpal input stream on a dedicated thread (streams
//! are not `Send`) and hands samples to the session through a lock-free SPSC
//! ring. The audio callback is the only producer; [`CaptureDevice::read_chunk`]
//! is the only consumer.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Ring capacity in seconds of audio
const RING_SECONDS: usize = 2;

/// Capture failures
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Capture device unavailable: {0}")]
    Unavailable(String),

    #[error("Capture stream error: {0}")]
    Stream(String),

    #[error("No capture session is open")]
    NotOpen,

    #[error("No audio received within {waited_ms}ms")]
    Stalled { waited_ms: u64 },
}

/// Token for an open capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureHandle {
    id: u64,
    sample_rate: u32,
    channels: u16,
}

impl CaptureHandle {
    pub fn new(id: u64, sample_rate: u32, channels: u16) -> Self {
        Self {
            id,
            sample_rate,
            channels,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Rate the device actually runs at
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Interleaved channels delivered by the device
    pub fn channels(&self) -> u16 {
        self.channels
    }
}

/// Source of captured audio
///
/// `read_chunk` must not block: it returns whatever arrived since the last
/// call, mono and channel-averaged, possibly empty.
#[async_trait]
pub trait CaptureDevice: Send {
    async fn open(&mut self, sample_rate: u32, channels: u16) -> Result<CaptureHandle, CaptureError>;

    async fn read_chunk(&mut self, handle: &CaptureHandle) -> Result<Vec<f32>, CaptureError>;

    async fn close(&mut self, handle: CaptureHandle);
}

/// Average interleaved frames down to mono; a trailing partial frame is dropped
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Interleaved format an input stream runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// One f32 input configuration range a device advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedInput {
    pub channels: u16,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
}

impl SupportedInput {
    fn accepts_rate(&self, rate: u32) -> bool {
        (self.min_sample_rate..=self.max_sample_rate).contains(&rate)
    }
}

/// Formats to try, best first
///
/// The requested format when a range supports it exactly; otherwise the
/// requested rate with the fewest channels the device offers at that rate
/// (capture is downmixed anyway); then the device default; the requested
/// format last so its build error is what surfaces.
pub fn input_candidates(
    requested: InputFormat,
    supported: &[SupportedInput],
    device_default: Option<InputFormat>,
) -> Vec<InputFormat> {
    let exact = supported
        .iter()
        .any(|r| r.channels == requested.channels && r.accepts_rate(requested.sample_rate));

    let mut candidates = Vec::new();
    if exact {
        candidates.push(requested);
    } else if let Some(range) = supported
        .iter()
        .filter(|r| r.channels > 0 && r.accepts_rate(requested.sample_rate))
        .min_by_key(|r| r.channels)
    {
        candidates.push(InputFormat {
            sample_rate: requested.sample_rate,
            channels: range.channels,
        });
    }
    for fallback in device_default.into_iter().chain(std::iter::once(requested)) {
        if !candidates.contains(&fallback) {
            candidates.push(fallback);
        }
    }
    candidates
}

fn supported_inputs(device: &cpal::Device) -> Vec<SupportedInput> {
    match device.supported_input_configs() {
        Ok(ranges) => ranges
            .filter(|r| r.sample_format() == cpal::SampleFormat::F32)
            .map(|r| SupportedInput {
                channels: r.channels(),
                min_sample_rate: r.min_sample_rate().0,
                max_sample_rate: r.max_sample_rate().0,
            })
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "capture_supported_configs_unavailable");
            Vec::new()
        }
    }
}

struct ActiveCapture {
    handle: CaptureHandle,
    consumer: HeapCons<f32>,
    stop_tx: crossbeam_channel::Sender<()>,
    thread: std::thread::JoinHandle<()>,
    overruns: Arc<AtomicU64>,
}

/// Default input device via cpal
#[derive(Default)]
pub struct CpalCapture {
    device_name: Option<String>,
    active: Option<ActiveCapture>,
    next_id: u64,
}

impl CpalCapture {
    /// Capture from the host's default input device
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture from the input device with this exact name
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Names of the available input devices
    pub fn list_devices() -> Result<Vec<String>, CaptureError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

fn find_input_device(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::Unavailable("no default input device".into())),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| CaptureError::Unavailable(format!("input device '{}' not found", wanted))),
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> CaptureError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::Unavailable("device disappeared".into())
        }
        cpal::BuildStreamError::BackendSpecific { err }
            if err.description.to_lowercase().contains("permission") =>
        {
            CaptureError::PermissionDenied(err.description)
        }
        other => CaptureError::Stream(other.to_string()),
    }
}

#[async_trait]
impl CaptureDevice for CpalCapture {
    async fn open(&mut self, sample_rate: u32, channels: u16) -> Result<CaptureHandle, CaptureError> {
        if let Some(previous) = self.active.take() {
            tracing::warn!(id = previous.handle.id, "capture_reopened_closing_previous");
            stop_thread(previous).await;
        }

        let requested = InputFormat {
            sample_rate,
            channels,
        };
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(InputFormat, HeapCons<f32>), CaptureError>>();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let overruns = Arc::new(AtomicU64::new(0));
        let callback_overruns = Arc::clone(&overruns);
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("speakersync-capture".into())
            .spawn(move || {
                let opened = (|| -> Result<(cpal::Stream, InputFormat, HeapCons<f32>), CaptureError> {
                    let device = find_input_device(device_name.as_deref())?;
                    let device_default = device.default_input_config().ok().map(|c| InputFormat {
                        sample_rate: c.sample_rate().0,
                        channels: c.channels(),
                    });
                    let candidates = input_candidates(requested, &supported_inputs(&device), device_default);

                    let mut last_error = None;
                    for format in candidates {
                        let ring = HeapRb::<f32>::new(
                            format.sample_rate as usize * format.channels.max(1) as usize * RING_SECONDS,
                        );
                        let (mut producer, consumer) = ring.split();
                        let callback_overruns = Arc::clone(&callback_overruns);
                        let config = cpal::StreamConfig {
                            channels: format.channels,
                            sample_rate: cpal::SampleRate(format.sample_rate),
                            buffer_size: cpal::BufferSize::Default,
                        };
                        let built = device.build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                let pushed = producer.push_slice(data);
                                if pushed < data.len() {
                                    callback_overruns
                                        .fetch_add((data.len() - pushed) as u64, Ordering::Relaxed);
                                }
                            },
                            move |err| {
                                tracing::error!(error = %err, "capture_stream_error");
                            },
                            None,
                        );
                        match built {
                            Ok(stream) => {
                                stream
                                    .play()
                                    .map_err(|e| CaptureError::Stream(e.to_string()))?;
                                return Ok((stream, format, consumer));
                            }
                            Err(e) => {
                                tracing::debug!(
                                    sample_rate = format.sample_rate,
                                    channels = format.channels,
                                    error = %e,
                                    "capture_format_rejected"
                                );
                                last_error = Some(map_build_error(e));
                            }
                        }
                    }
                    Err(last_error.unwrap_or_else(|| CaptureError::Stream("no input format to try".into())))
                })();

                match opened {
                    Ok((stream, format, consumer)) => {
                        let _ = ready_tx.send(Ok((format, consumer)));
                        // Hold the stream until stop is requested or the session is dropped
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        let (format, consumer) = ready_rx
            .await
            .map_err(|_| CaptureError::Stream("capture thread exited".into()))??;
        if format != requested {
            tracing::warn!(
                requested_rate = sample_rate,
                requested_channels = channels,
                sample_rate = format.sample_rate,
                channels = format.channels,
                "capture_format_fallback"
            );
        }

        self.next_id += 1;
        let handle = CaptureHandle::new(self.next_id, format.sample_rate, format.channels);
        tracing::info!(
            id = handle.id,
            sample_rate = format.sample_rate,
            channels = format.channels,
            device = self.device_name.as_deref().unwrap_or("default"),
            "capture_opened"
        );

        self.active = Some(ActiveCapture {
            handle: handle.clone(),
            consumer,
            stop_tx,
            thread,
            overruns,
        });
        Ok(handle)
    }

    async fn read_chunk(&mut self, handle: &CaptureHandle) -> Result<Vec<f32>, CaptureError> {
        let active = self
            .active
            .as_mut()
            .filter(|a| a.handle == *handle)
            .ok_or(CaptureError::NotOpen)?;

        if active.thread.is_finished() {
            return Err(CaptureError::Stream("capture thread stopped".into()));
        }

        let channels = handle.channels.max(1) as usize;
        let available = active.consumer.occupied_len();
        let mut buf = vec![0.0f32; available - available % channels];
        let n = active.consumer.pop_slice(&mut buf);
        buf.truncate(n);
        Ok(downmix(&buf, handle.channels))
    }

    async fn close(&mut self, handle: CaptureHandle) {
        match self.active.take() {
            Some(active) if active.handle == handle => stop_thread(active).await,
            other => {
                self.active = other;
                tracing::debug!(id = handle.id, "capture_close_unknown_handle");
            }
        }
    }
}

async fn stop_thread(active: ActiveCapture) {
    let overruns = active.overruns.load(Ordering::Relaxed);
    let _ = active.stop_tx.send(());
    let thread = active.thread;
    let _ = tokio::task::spawn_blocking(move || thread.join()).await;
    tracing::info!(id = active.handle.id, overruns, "capture_closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[0.2, 0.4, -1.0, 1.0, 0.5, 0.5], 2);
        assert_eq!(mono.len(), 3);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert_eq!(mono[1], 0.0);
        assert!((mono[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_downmix_drops_partial_frame() {
        assert_eq!(downmix(&[1.0, 1.0, 1.0, 1.0, 1.0], 4), vec![1.0]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
        assert_eq!(downmix(&[0.1, 0.2], 0), vec![0.1, 0.2]);
    }

    fn format(sample_rate: u32, channels: u16) -> InputFormat {
        InputFormat {
            sample_rate,
            channels,
        }
    }

    fn range(channels: u16, min: u32, max: u32) -> SupportedInput {
        SupportedInput {
            channels,
            min_sample_rate: min,
            max_sample_rate: max,
        }
    }

    #[test]
    fn test_candidates_requested_format_supported() {
        let supported = [range(1, 8000, 96000), range(2, 8000, 96000)];
        let candidates = input_candidates(format(48000, 1), &supported, Some(format(44100, 2)));
        assert_eq!(candidates, vec![format(48000, 1), format(44100, 2)]);
    }

    #[test]
    fn test_candidates_stereo_only_device() {
        // Mono requested from an interface that only opens in stereo
        let supported = [range(2, 44100, 48000), range(4, 44100, 48000)];
        let candidates = input_candidates(format(48000, 1), &supported, Some(format(44100, 2)));
        assert_eq!(
            candidates,
            vec![format(48000, 2), format(44100, 2), format(48000, 1)]
        );
    }

    #[test]
    fn test_candidates_rate_unsupported_uses_device_default() {
        let supported = [range(2, 44100, 44100)];
        let candidates = input_candidates(format(48000, 1), &supported, Some(format(44100, 2)));
        assert_eq!(candidates[0], format(44100, 2));
        assert_eq!(candidates.last(), Some(&format(48000, 1)));
    }

    #[test]
    fn test_candidates_without_device_information() {
        let candidates = input_candidates(format(48000, 1), &[], None);
        assert_eq!(candidates, vec![format(48000, 1)]);
    }

    #[tokio::test]
    async fn test_read_without_open() {
        let mut capture = CpalCapture::new();
        let handle = CaptureHandle::new(7, 48000, 1);
        assert!(matches!(
            capture.read_chunk(&handle).await,
            Err(CaptureError::NotOpen)
        ));
        // Closing an unknown handle is a no-op
        capture.close(handle).await;
    }
}
