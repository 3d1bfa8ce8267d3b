//! Delivery of finished calibrations

use async_trait::async_trait;
use serde::Serialize;
use speakersync_core::{CalibrationResult, OffsetCorrection};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Receives each completed calibration and its correction
#[async_trait]
pub trait ResultSink: Send {
    async fn deliver(&mut self, result: &CalibrationResult, correction: &OffsetCorrection) -> Result<(), SinkError>;
}

#[derive(Serialize)]
struct Record<'a> {
    result: &'a CalibrationResult,
    correction: &'a OffsetCorrection,
}

/// Appends one JSON object per calibration to a writer
pub struct JsonLinesSink {
    writer: Box<dyn Write + Send>,
}

impl JsonLinesSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { writer }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Append to `path`, creating it if needed
    pub fn file(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn deliver(&mut self, result: &CalibrationResult, correction: &OffsetCorrection) -> Result<(), SinkError> {
        let line = serde_json::to_string(&Record { result, correction })?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        tracing::info!(
            endpoint_id = %correction.endpoint_id,
            offset_ms = correction.offset_ms,
            "correction_delivered"
        );
        Ok(())
    }
}
