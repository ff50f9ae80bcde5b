//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error from postcard
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Incompatible protocol version detected
    #[error(
        "Incompatible protocol version: {major}.{minor} (expected {expected_major}.{expected_minor})"
    )]
    IncompatibleVersion {
        major: u8,
        minor: u8,
        expected_major: u8,
        expected_minor: u8,
    },

    /// Compressed payload tagged with an algorithm id we do not know
    #[error("Unknown compression algorithm: {0}")]
    UnknownCompressionAlgorithm(u8),

    /// Declared uncompressed size is zero or larger than a frame may carry
    #[error("Invalid uncompressed size: {0}")]
    InvalidUncompressedSize(u32),

    /// Decompressed length differs from the size declared in the envelope
    #[error("Uncompressed size mismatch: declared {expected}, got {actual}")]
    UncompressedSizeMismatch { expected: usize, actual: usize },

    /// The codec rejected the compressed stream
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error came from validating a compressed envelope
    ///
    /// These errors drop the offending message but leave the channel usable.
    pub fn is_compression_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownCompressionAlgorithm(_)
                | ProtocolError::InvalidUncompressedSize(_)
                | ProtocolError::UncompressedSizeMismatch { .. }
                | ProtocolError::Decompression(_)
        )
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
