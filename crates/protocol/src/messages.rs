//! Protocol message definitions
//!
//! The VMC data channel carries opaque redirected-device bytes in both
//! directions, either raw or wrapped in a compressed envelope.

use crate::codec::MAX_FRAME_SIZE;
use crate::compression::{BlockCodec, CompressionType};
use crate::error::{ProtocolError, Result};
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};

/// Top-level message envelope
///
/// All protocol messages are wrapped in this envelope which includes
/// the protocol version for compatibility checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version of this message
    pub version: ProtocolVersion,
    /// Message payload
    pub payload: VmcMessage,
}

impl Message {
    /// Wrap a payload in an envelope stamped with the current version
    pub fn new(payload: VmcMessage) -> Self {
        Self {
            version: crate::version::CURRENT_VERSION,
            payload,
        }
    }
}

/// Messages on the VMC data channel (symmetric: same set in both directions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmcMessage {
    /// Raw redirected device payload
    Data {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// Compressed redirected device payload
    CompressedData(CompressedData),
}

impl VmcMessage {
    /// Size of the payload as carried on the wire
    pub fn wire_len(&self) -> usize {
        match self {
            VmcMessage::Data { data } => data.len(),
            VmcMessage::CompressedData(c) => c.data.len(),
        }
    }
}

/// Compressed payload envelope
///
/// Always carries the original size so the receiver can validate the
/// decompressed result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedData {
    /// Algorithm id (see [`CompressionType`])
    pub compression: u8,
    /// Size of the payload before compression
    pub uncompressed_size: u32,
    /// Compressed bytes
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl CompressedData {
    /// Wrap an already-compressed buffer
    pub fn new(compression: CompressionType, uncompressed_size: u32, data: Vec<u8>) -> Self {
        Self {
            compression: compression.id(),
            uncompressed_size,
            data,
        }
    }

    /// Size of the compressed bytes
    pub fn compressed_size(&self) -> usize {
        self.data.len()
    }

    /// Decompress and validate the envelope
    ///
    /// Fails if the declared size is zero (or exceeds a frame), the algorithm
    /// is unknown or has no codec available, or the stream does not expand
    /// to exactly the declared size.
    pub fn decompress(&self, codec: Option<&dyn BlockCodec>) -> Result<Vec<u8>> {
        let expected = self.uncompressed_size as usize;
        if expected == 0 || expected > MAX_FRAME_SIZE {
            return Err(ProtocolError::InvalidUncompressedSize(self.uncompressed_size));
        }

        let compression = CompressionType::try_from(self.compression)?;
        let codec = codec
            .filter(|c| c.compression_type() == compression)
            .ok_or(ProtocolError::UnknownCompressionAlgorithm(self.compression))?;

        let decompressed = codec.decompress(&self.data, expected)?;
        if decompressed.len() != expected {
            return Err(ProtocolError::UncompressedSizeMismatch {
                expected,
                actual: decompressed.len(),
            });
        }

        Ok(decompressed)
    }
}
