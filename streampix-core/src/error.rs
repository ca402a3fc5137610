//! Error types for streampix-core.

use thiserror::Error;

/// Result type alias for streampix operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for streampix operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid TDC trigger bit pattern.
    #[error("invalid TDC trigger pattern: {0:#x}")]
    InvalidTriggerPattern(u8),

    /// Unknown operating mode requested by a client.
    #[error("unknown run mode: {0}")]
    InvalidRunMode(u16),

    /// Calibration table error.
    #[error("calibration error: {0}")]
    CalibrationError(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error while loading configuration or calibration.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed calibration or settings file.
    #[error("deserialization error: {0}")]
    DeserializeError(#[from] serde_json::Error),
}
