//! Kalman-filter clock synchronizer
//!
//! Tracks `x = [offset, drift]` between the local clock and a remote
//! reference. Offset is in microseconds (remote minus local), drift in
//! microseconds per second. The offset evolves as `offset + drift * dt` and
//! drift is a random walk.
//!
//! Each measurement is a four-timestamp round trip:
//!
//! ```text
//! local  t1 ──request──▶ t2 remote
//! local  t4 ◀──reply──── t3 remote
//! ```
//!
//! giving `offset = ((t2 - t1) + (t3 - t4)) / 2` and
//! `rtt = (t4 - t1) - (t3 - t2)`. Measurement noise grows with `rtt²`, so
//! slow exchanges barely move the estimate.

use serde::{Deserialize, Serialize};

/// Initial offset variance (µs²), about one second of uncertainty
const PRIOR_OFFSET_VARIANCE: f64 = 1e12;
/// Initial drift variance ((µs/s)²)
const PRIOR_DRIFT_VARIANCE: f64 = 1e6;
/// Lower bound for both variances after an update
const VARIANCE_FLOOR: f64 = 1e-3;

/// Filter tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSyncConfig {
    /// Offset process noise per second (µs²/s)
    pub process_noise_offset: f64,
    /// Drift process noise per second ((µs/s)²/s)
    pub process_noise_drift: f64,
    /// Measurement noise floor before the RTT term (µs²)
    pub measurement_noise_base: f64,
    /// Offset standard deviation below which the estimate counts as converged (µs)
    pub convergence_threshold_us: f64,
    /// Samples required before convergence can be reported
    pub min_samples: u32,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            process_noise_offset: 1.0,
            process_noise_drift: 0.01,
            measurement_noise_base: 100.0,
            convergence_threshold_us: 2000.0,
            min_samples: 3,
        }
    }
}

/// One NTP-style round trip, all timestamps in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeExchangeSample {
    /// Local send time
    pub t1: i64,
    /// Remote receive time
    pub t2: i64,
    /// Remote send time
    pub t3: i64,
    /// Local receive time
    pub t4: i64,
}

impl TimeExchangeSample {
    /// Measured offset, remote minus local (µs)
    pub fn offset_us(&self) -> f64 {
        ((self.t2 - self.t1) + (self.t3 - self.t4)) as f64 / 2.0
    }

    /// Network round trip excluding remote processing (µs)
    pub fn rtt_us(&self) -> f64 {
        ((self.t4 - self.t1) - (self.t3 - self.t2)) as f64
    }
}

/// Current filter state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockEstimate {
    /// Remote minus local (µs)
    pub offset_us: f64,
    /// Offset change per second (µs/s)
    pub drift_us_per_sec: f64,
    /// P00 (µs²)
    pub offset_variance_us2: f64,
    /// P11 ((µs/s)²)
    pub drift_variance_us2: f64,
    /// P01
    pub covariance_us2: f64,
    /// Local `t4` of the last applied sample (µs)
    pub last_update_time_us: f64,
    /// Number of applied samples
    pub sample_count: u32,
}

impl Default for ClockEstimate {
    fn default() -> Self {
        Self {
            offset_us: 0.0,
            drift_us_per_sec: 0.0,
            offset_variance_us2: PRIOR_OFFSET_VARIANCE,
            drift_variance_us2: PRIOR_DRIFT_VARIANCE,
            covariance_us2: 0.0,
            last_update_time_us: 0.0,
            sample_count: 0,
        }
    }
}

impl ClockEstimate {
    /// Offset standard deviation (µs)
    pub fn offset_std_dev_us(&self) -> f64 {
        self.offset_variance_us2.sqrt()
    }

    /// Offset projected to a local time using the drift estimate
    pub fn offset_at(&self, local_time_us: f64) -> f64 {
        let elapsed_sec = (local_time_us - self.last_update_time_us) / 1e6;
        self.offset_us + self.drift_us_per_sec * elapsed_sec
    }
}

/// What happened to a submitted sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasurementOutcome {
    /// First sample: state seeded directly from the measurement
    Initialized { offset_us: f64 },
    /// Regular predict/update step
    Updated { innovation_us: f64, offset_us: f64 },
    /// Sample not newer than the last applied one; state untouched
    Rejected { dt_us: f64 },
}

/// Offset/drift estimator for one remote clock
///
/// One instance per session; call [`reset`](Self::reset) before reuse.
///
/// # Example
/// ```
/// use speakersync_core::sync::clock::{ClockSynchronizer, TimeExchangeSample};
///
/// let mut sync = ClockSynchronizer::default();
/// for i in 0..5i64 {
///     let t1 = i * 1_000_000;
///     // Remote runs 2500µs ahead, 100µs each way
///     sync.process_measurement(TimeExchangeSample {
///         t1,
///         t2: t1 + 100 + 2500,
///         t3: t1 + 200 + 2500,
///         t4: t1 + 300,
///     });
/// }
/// assert!(sync.is_converged());
/// assert!((sync.estimate().offset_us - 2500.0).abs() < 1.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClockSynchronizer {
    config: ClockSyncConfig,
    state: ClockEstimate,
}

impl ClockSynchronizer {
    /// Create a synchronizer at high-uncertainty priors
    pub fn new(config: ClockSyncConfig) -> Self {
        Self {
            config,
            state: ClockEstimate::default(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ClockSyncConfig {
        &self.config
    }

    /// Snapshot of the current estimate
    pub fn estimate(&self) -> ClockEstimate {
        self.state
    }

    /// Current offset standard deviation (µs)
    pub fn offset_std_dev_us(&self) -> f64 {
        self.state.offset_std_dev_us()
    }

    /// Apply one round trip
    pub fn process_measurement(&mut self, sample: TimeExchangeSample) -> MeasurementOutcome {
        let measured = sample.offset_us();
        let rtt = sample.rtt_us();
        let t4 = sample.t4 as f64;

        if self.state.sample_count == 0 {
            self.state.offset_us = measured;
            self.state.drift_us_per_sec = 0.0;
            self.state.last_update_time_us = t4;
            self.state.sample_count = 1;
            tracing::debug!(offset_us = measured, rtt_us = rtt, "clock_initialized");
            return MeasurementOutcome::Initialized { offset_us: measured };
        }

        let dt_us = t4 - self.state.last_update_time_us;
        if dt_us <= 0.0 {
            tracing::debug!(
                dt_us,
                t4 = sample.t4,
                last_update_us = self.state.last_update_time_us,
                "clock_sample_rejected"
            );
            return MeasurementOutcome::Rejected { dt_us };
        }
        let dt = dt_us / 1e6;

        let s = &mut self.state;

        // Predict
        let predicted_offset = s.offset_us + s.drift_us_per_sec * dt;
        let predicted_drift = s.drift_us_per_sec;
        let p00 = s.offset_variance_us2
            + 2.0 * s.covariance_us2 * dt
            + s.drift_variance_us2 * dt * dt
            + self.config.process_noise_offset * dt;
        let p01 = s.covariance_us2 + s.drift_variance_us2 * dt;
        let p11 = s.drift_variance_us2 + self.config.process_noise_drift * dt;

        // Update
        let r = self.config.measurement_noise_base + rtt * rtt / 4.0;
        let innovation = measured - predicted_offset;
        let innovation_var = p00 + r;
        let k0 = p00 / innovation_var;
        let k1 = p01 / innovation_var;

        s.offset_us = predicted_offset + k0 * innovation;
        s.drift_us_per_sec = predicted_drift + k1 * innovation;
        s.offset_variance_us2 = ((1.0 - k0) * p00).max(VARIANCE_FLOOR);
        s.covariance_us2 = (1.0 - k0) * p01;
        s.drift_variance_us2 = (p11 - k1 * p01).max(VARIANCE_FLOOR);
        s.last_update_time_us = t4;
        s.sample_count += 1;

        tracing::debug!(
            offset_us = s.offset_us,
            drift_us_per_sec = s.drift_us_per_sec,
            std_dev_us = s.offset_variance_us2.sqrt(),
            innovation_us = innovation,
            rtt_us = rtt,
            samples = s.sample_count,
            "clock_measurement"
        );

        MeasurementOutcome::Updated {
            innovation_us: innovation,
            offset_us: s.offset_us,
        }
    }

    /// `sample_count >= min_samples` and offset σ below the threshold
    pub fn is_converged(&self) -> bool {
        self.state.sample_count >= self.config.min_samples
            && self.state.offset_std_dev_us() < self.config.convergence_threshold_us
    }

    /// Map a local timestamp (µs) onto the remote clock
    pub fn local_to_remote_time(&self, local_time_us: f64) -> f64 {
        local_time_us + self.state.offset_at(local_time_us)
    }

    /// Map a remote timestamp (µs) onto the local clock
    pub fn remote_to_local_time(&self, remote_time_us: f64) -> f64 {
        let approx_local = remote_time_us - self.state.offset_us;
        remote_time_us - self.state.offset_at(approx_local)
    }

    /// Back to priors, as if freshly constructed
    pub fn reset(&mut self) {
        self.state = ClockEstimate::default();
    }
}
