//! Time-exchange loop against the reference server
//!
//! Sends a short burst of requests to get the filter past its priors quickly,
//! then settles to a steady cadence until the estimate converges or the
//! timeout passes.

use crate::channel::{ChannelError, MessageChannel};
use crate::{CancelToken, SessionEvent};
use speakersync_core::config::SessionTiming;
use speakersync_core::sync::clock::{ClockEstimate, ClockSynchronizer, MeasurementOutcome};
use speakersync_core::sync::protocol::{ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

/// Monotonic microsecond clock for one session
///
/// Built on the tokio clock so paused-time tests stay deterministic.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Microseconds since the session started
    pub fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }
}

/// How the exchange loop ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    Converged(ClockEstimate),
    TimedOut(ClockEstimate),
    Cancelled,
}

/// Exchange time samples over a connected channel
///
/// Malformed server frames are logged and skipped. Transport failures and a
/// closed channel end the loop with an error.
pub async fn run_exchange(
    channel: &mut dyn MessageChannel,
    synchronizer: &mut ClockSynchronizer,
    timing: &SessionTiming,
    clock: &SessionClock,
    cancel: &CancelToken,
    events: &broadcast::Sender<SessionEvent>,
) -> Result<SyncOutcome, ChannelError> {
    let deadline = tokio::time::sleep(Duration::from_millis(timing.sync_timeout_ms));
    tokio::pin!(deadline);

    let steady = Duration::from_millis(timing.steady_interval_ms.max(1));
    let mut ticker = if timing.burst_samples > 0 {
        interval(Duration::from_millis(timing.burst_interval_ms.max(1)))
    } else {
        interval(steady)
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut requests_sent = 0u32;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(SyncOutcome::Cancelled),

            _ = &mut deadline => {
                let estimate = synchronizer.estimate();
                tracing::warn!(
                    samples = estimate.sample_count,
                    std_dev_us = estimate.offset_std_dev_us(),
                    timeout_ms = timing.sync_timeout_ms,
                    "clock_sync_timeout"
                );
                return Ok(SyncOutcome::TimedOut(estimate));
            }

            message = channel.next_message() => match message {
                None => return Err(ChannelError::Closed),
                Some(Err(ChannelError::Protocol(e))) => {
                    tracing::warn!(error = %e, "clock_sync_malformed_message");
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(ServerMessage::Hello(hello))) => {
                    tracing::debug!(server_id = ?hello.server_id, version = ?hello.version, "server_hello");
                }
                Some(Ok(ServerMessage::Time(time))) => {
                    let sample = time.into_sample(clock.now_us());
                    if let MeasurementOutcome::Rejected { .. } = synchronizer.process_measurement(sample) {
                        continue;
                    }
                    let estimate = synchronizer.estimate();
                    let converged = synchronizer.is_converged();
                    let _ = events.send(SessionEvent::ClockUpdate {
                        offset_us: estimate.offset_us,
                        std_dev_us: estimate.offset_std_dev_us(),
                        samples: estimate.sample_count,
                        converged,
                    });
                    if converged {
                        tracing::info!(
                            offset_us = estimate.offset_us,
                            drift_us_per_sec = estimate.drift_us_per_sec,
                            std_dev_us = estimate.offset_std_dev_us(),
                            samples = estimate.sample_count,
                            "clock_synced"
                        );
                        return Ok(SyncOutcome::Converged(estimate));
                    }
                }
            },

            _ = ticker.tick() => {
                channel.send(&ClientMessage::time_request(clock.now_us())).await?;
                requests_sent += 1;
                if requests_sent == timing.burst_samples {
                    ticker = interval_at(Instant::now() + steady, steady);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimReferenceChannel;

    fn timing() -> SessionTiming {
        SessionTiming {
            burst_samples: 4,
            burst_interval_ms: 20,
            steady_interval_ms: 500,
            sync_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_against_reference() {
        let mut channel = SimReferenceChannel::new(-12_500);
        channel.connect("sim://reference").await.unwrap();
        let mut sync = ClockSynchronizer::default();
        let (tx, mut rx) = broadcast::channel(64);

        let outcome = run_exchange(
            &mut channel,
            &mut sync,
            &timing(),
            &SessionClock::start(),
            &CancelToken::new(),
            &tx,
        )
        .await
        .unwrap();

        let SyncOutcome::Converged(estimate) = outcome else {
            panic!("expected convergence, got {:?}", outcome);
        };
        assert!((estimate.offset_us + 12_500.0).abs() < 1.0);
        assert_eq!(estimate.sample_count, 3);
        assert!(sync.is_converged());

        let mut updates = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::ClockUpdate { .. }) {
                updates += 1;
            }
        }
        // One per applied sample, including the initializing one
        assert_eq!(updates, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let mut channel = SimReferenceChannel::silent();
        channel.connect("sim://reference").await.unwrap();
        let mut sync = ClockSynchronizer::default();
        let (tx, _rx) = broadcast::channel(64);

        let start = Instant::now();
        let outcome = run_exchange(
            &mut channel,
            &mut sync,
            &timing(),
            &SessionClock::start(),
            &CancelToken::new(),
            &tx,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, SyncOutcome::TimedOut(e) if e.sample_count == 0));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2_000) && elapsed < Duration::from_millis(2_010));
        // Four burst requests plus steady ones at 560, 1060, 1560ms
        assert_eq!(channel.requests_received(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_exchange() {
        let mut channel = SimReferenceChannel::silent();
        channel.connect("sim://reference").await.unwrap();
        let mut sync = ClockSynchronizer::default();
        let (tx, _rx) = broadcast::channel(64);
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = run_exchange(
            &mut channel,
            &mut sync,
            &timing(),
            &SessionClock::start(),
            &cancel,
            &tx,
        )
        .await
        .unwrap();
        assert_eq!(outcome, SyncOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_skipped() {
        let mut channel = SimReferenceChannel::new(3_000).with_garbage_every(2);
        channel.connect("sim://reference").await.unwrap();
        let mut sync = ClockSynchronizer::default();
        let (tx, _rx) = broadcast::channel(64);

        let outcome = run_exchange(
            &mut channel,
            &mut sync,
            &timing(),
            &SessionClock::start(),
            &CancelToken::new(),
            &tx,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, SyncOutcome::Converged(_)));
    }
}
