//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The upstream detector connection closed.
    #[error("upstream disconnected: {0}")]
    UpstreamDisconnect(String),

    /// The downstream consumer is gone after repeated attempts.
    #[error("downstream consumer lost: {0}")]
    ConsumerLost(String),

    /// Invalid replay capture or handshake bytes.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] streampix_core::Error),

    /// Wire-format error.
    #[error("wire error: {0}")]
    WireError(#[from] streampix_tpx::Error),
}
