//! Block compression for VMC payloads
//!
//! A codec is an optional strategy object: a channel built without one never
//! advertises the compression capability and rejects compressed envelopes as
//! carrying an unknown algorithm.

use crate::error::{ProtocolError, Result};

/// Compression algorithm ids carried in [`crate::CompressedData`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionType {
    /// LZ4 block format
    Lz4 = 1,
}

impl CompressionType {
    /// Wire id of this algorithm
    pub fn id(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CompressionType::Lz4),
            other => Err(ProtocolError::UnknownCompressionAlgorithm(other)),
        }
    }
}

/// A reversible block compressor
pub trait BlockCodec: Send + Sync + std::fmt::Debug {
    /// Algorithm implemented by this codec
    fn compression_type(&self) -> CompressionType;

    /// Compress `data` into a fresh buffer
    ///
    /// Returns `None` if the codec failed. The result may be larger than the
    /// input; callers decide whether compression was worthwhile.
    fn compress(&self, data: &[u8]) -> Option<Vec<u8>>;

    /// Decompress `data`, which is expected to expand to `uncompressed_size` bytes
    ///
    /// The returned buffer holds however many bytes the stream actually
    /// produced, up to `uncompressed_size`.
    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>>;
}

/// LZ4 block codec backed by `lz4_flex`
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl BlockCodec for Lz4Codec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        let bound = lz4_flex::block::get_maximum_output_size(data.len());
        if bound == 0 {
            return None;
        }

        let mut out = vec![0u8; bound];
        match lz4_flex::block::compress_into(data, &mut out) {
            Ok(written) if written > 0 => {
                out.truncate(written);
                Some(out)
            }
            _ => None,
        }
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; uncompressed_size];
        let written = lz4_flex::block::decompress_into(data, &mut out)
            .map_err(|e| ProtocolError::Decompression(e.to_string()))?;
        out.truncate(written);
        Ok(out)
    }
}
