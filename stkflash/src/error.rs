//! Error types for stkflash.

use std::io;
use thiserror::Error;

/// Result type for stkflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for stkflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, image storage).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The storage collaborator could not open the named image.
    #[error("Image not found: {name}")]
    ImageNotFound {
        /// Name passed to the storage layer.
        name: String,
    },

    /// An operation needed a loaded image but none is open.
    #[error("No image loaded")]
    NoImageLoaded,

    /// A character outside `0-9A-Fa-f` appeared inside a hex pair.
    #[error("Malformed hex digit {found:?} at byte {position}")]
    MalformedHexDigit {
        /// The offending character.
        found: char,
        /// Offset of the character in the image text.
        position: u64,
    },

    /// The target did not answer within the configured bound.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A wait was abandoned because cancellation was requested.
    #[error("Operation cancelled")]
    Cancelled,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No serial port could be selected.
    #[error("Device not found")]
    DeviceNotFound,
}

impl Error {
    /// Whether the error came from a bounded protocol wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
