//! Calibration configuration
//!
//! One serde document bundling every tunable of a session. Stored as JSON at
//! `<config_dir>/speakersync/config.json`; missing fields take defaults so
//! partial files stay valid across versions.

use crate::audio::click::ClickTrackConfig;
use crate::audio::detector::DetectorConfig;
use crate::audio::offset::AggregatorConfig;
use crate::sync::clock::ClockSyncConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Click interval {interval_ms}ms must exceed click duration {duration_ms}ms")]
    ClickSpacing { interval_ms: f64, duration_ms: f64 },

    #[error("At least one click frequency is required")]
    NoFrequencies,

    #[error("{0} must be greater than zero")]
    NonPositive(&'static str),

    #[error("Frequency {frequency_hz}Hz is above Nyquist for {sample_rate}Hz")]
    AboveNyquist { frequency_hz: f64, sample_rate: u32 },
}

/// Bounded reconnect schedule for the message channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total connection attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt (ms)
    pub base_delay_ms: u64,
    /// Growth factor applied to the delay after each failure
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based; the first attempt has none)
    pub fn delay_before(&self, attempt: u32) -> std::time::Duration {
        if attempt <= 1 {
            return std::time::Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 2);
        std::time::Duration::from_millis((self.base_delay_ms as f64 * factor) as u64)
    }
}

/// Timing of the session phases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTiming {
    /// Rapid time requests sent right after connecting
    pub burst_samples: u32,
    /// Spacing of the burst requests (ms)
    pub burst_interval_ms: u64,
    /// Spacing of requests after the burst (ms)
    pub steady_interval_ms: u64,
    /// Give up on convergence after this long (ms)
    pub sync_timeout_ms: u64,
    /// Continue without clock sync when it fails
    pub allow_unsynced_fallback: bool,
    /// Allowance for playback start-up on top of the track length (ms)
    pub startup_slack_ms: u64,
    /// Capture poll period while listening (ms)
    pub capture_poll_ms: u64,
    /// Channels requested from the capture device
    pub capture_channels: u16,
    /// Reconnect schedule for the message channel
    pub retry: RetryPolicy,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            burst_samples: 8,
            burst_interval_ms: 50,
            steady_interval_ms: 1000,
            sync_timeout_ms: 5000,
            allow_unsynced_fallback: true,
            startup_slack_ms: 3000,
            capture_poll_ms: 10,
            capture_channels: 1,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything a calibration session needs to know
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub click: ClickTrackConfig,
    pub detector: DetectorConfig,
    pub aggregator: AggregatorConfig,
    pub clock: ClockSyncConfig,
    pub session: SessionTiming,
}

impl CalibrationConfig {
    /// Default config file path: `<config_dir>/speakersync/config.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("speakersync")
            .join("config.json")
    }

    /// Read and parse a config file
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Load config from disk, falling back to defaults on any error
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "config_loaded");
                config
            }
            Err(ConfigError::Io(_)) => {
                tracing::info!(path = %path.display(), "config_missing_using_defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "config_invalid_using_defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "config_saved");
        Ok(())
    }

    /// Check cross-field constraints before a session starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        let click = &self.click;
        if click.sample_rate == 0 {
            return Err(ConfigError::NonPositive("click.sample_rate"));
        }
        if click.frequencies.is_empty() {
            return Err(ConfigError::NoFrequencies);
        }
        if click.total_duration_sec <= 0.0 {
            return Err(ConfigError::NonPositive("click.total_duration_sec"));
        }
        if click.click_duration_ms <= 0.0 {
            return Err(ConfigError::NonPositive("click.click_duration_ms"));
        }
        if click.click_interval_ms <= click.click_duration_ms {
            return Err(ConfigError::ClickSpacing {
                interval_ms: click.click_interval_ms,
                duration_ms: click.click_duration_ms,
            });
        }
        let nyquist = click.sample_rate as f64 / 2.0;
        if let Some(&f) = click.frequencies.iter().find(|&&f| f <= 0.0 || f >= nyquist) {
            if f <= 0.0 {
                return Err(ConfigError::NonPositive("click.frequencies"));
            }
            return Err(ConfigError::AboveNyquist {
                frequency_hz: f,
                sample_rate: click.sample_rate,
            });
        }

        if self.detector.chunk_size == 0 {
            return Err(ConfigError::NonPositive("detector.chunk_size"));
        }
        if self.detector.fft_size == 0 {
            return Err(ConfigError::NonPositive("detector.fft_size"));
        }
        if self.aggregator.match_window_ms <= 0.0 {
            return Err(ConfigError::NonPositive("aggregator.match_window_ms"));
        }
        if self.session.capture_channels == 0 {
            return Err(ConfigError::NonPositive("session.capture_channels"));
        }
        if self.session.retry.max_attempts == 0 {
            return Err(ConfigError::NonPositive("session.retry.max_attempts"));
        }
        if self.session.capture_poll_ms == 0 {
            return Err(ConfigError::NonPositive("session.capture_poll_ms"));
        }
        Ok(())
    }
}
