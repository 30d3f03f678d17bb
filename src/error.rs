//! Error types for Bedside Flux
//!
//! Two layers:
//! - [`SignalError`]: failures scoped to a single estimation call. Callers skip
//!   the tick or channel and keep their long-lived state.
//! - [`EngineError`]: session-level failures that stop a pipeline run.

use thiserror::Error;

use crate::types::Side;

/// Outcome of a single waveform estimation that produced no measurement
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    #[error("Bad signal: {0}")]
    BadSignal(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Numeric result is not a number: {0}")]
    NumericInvalid(String),
}

/// Result of one estimation call
pub type SignalResult<T> = Result<T, SignalError>;

/// Errors that terminate or prevent a processing session
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No capacitance baseline found for {0} side; run calibration first")]
    CalibrationNotFound(Side),

    #[error("Frame source exhausted without a frame in range")]
    SourceExhausted,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid time range: {0}")]
    InvalidRange(String),

    #[error("Signal chain setup failed: {0}")]
    Signal(#[from] SignalError),

    #[error("Sink rejected record: {0}")]
    Sink(String),

    #[error("Pipeline task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Cannot render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),
}
