//! Wire-format error types.

use thiserror::Error;

/// Result type for wire-format operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-format error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk header violated a framing invariant.
    #[error("malformed chunk at offset {offset}: {reason}")]
    MalformedChunk {
        /// Stream offset of the offending header.
        offset: u64,
        /// Which invariant failed.
        reason: String,
    },

    /// TDC packet carried an unknown trigger pattern.
    #[error("malformed TDC trigger pattern: {0:#x}")]
    MalformedTdc(u8),

    /// The malformed-chunk recovery budget is exhausted.
    #[error("resync budget exhausted after {0} recoveries")]
    ResyncBudgetExhausted(u64),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] streampix_core::Error),
}
