//! Outbound write path
//!
//! The bridge hands payloads up through [`OutboundPath`], which decides per
//! payload whether to wrap it in a compressed envelope before passing it to
//! the transport.

use crate::error::TransportError;
use common::{ChannelWriter, WriteBuffer};
use protocol::{
    BlockCodec, Capabilities, Capability, CompressedData, CompressionType, Message, VmcMessage,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{trace, warn};

/// Payloads of this many bytes or fewer are always sent raw
pub const COMPRESS_THRESHOLD: usize = 1000;

/// A message queued for the peer
///
/// Raw payloads keep the bridge's buffer alive until the transport drops the
/// message, which hands the buffer back to the bridge.
#[derive(Debug)]
pub enum OutboundMessage {
    Data(WriteBuffer),
    Compressed(CompressedData),
}

impl OutboundMessage {
    /// Build the wire message
    pub fn to_message(&self) -> Message {
        let payload = match self {
            OutboundMessage::Data(buffer) => VmcMessage::Data {
                data: buffer.as_slice().to_vec(),
            },
            OutboundMessage::Compressed(compressed) => {
                VmcMessage::CompressedData(compressed.clone())
            }
        };
        Message::new(payload)
    }

    /// Bytes this message occupies on the wire
    pub fn wire_len(&self) -> usize {
        match self {
            OutboundMessage::Data(buffer) => buffer.len(),
            OutboundMessage::Compressed(compressed) => compressed.compressed_size(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, OutboundMessage::Compressed(_))
    }
}

/// Byte-stream link to the VM peer
pub trait Transport: Send + Sync {
    /// Queue a message; the transport drops it once written
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Trusted local pipe (e.g. a unix socket); never worth compressing for
    fn is_local(&self) -> bool;
}

/// Capability bit the peer must advertise before we use `compression`
pub fn capability_for(compression: CompressionType) -> Capability {
    match compression {
        CompressionType::Lz4 => Capability::DataCompressLz4,
    }
}

/// The writer handed to the device bridge
///
/// Never takes the channel lock: it runs inside bridge calls that already
/// hold it.
pub struct OutboundPath {
    transport: Arc<dyn Transport>,
    codec: Option<Arc<dyn BlockCodec>>,
    peer_caps: Arc<AtomicU32>,
    isochronous: AtomicBool,
}

impl OutboundPath {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Option<Arc<dyn BlockCodec>>,
        peer_caps: Arc<AtomicU32>,
    ) -> Self {
        Self {
            transport,
            codec,
            peer_caps,
            isochronous: AtomicBool::new(false),
        }
    }

    /// Record whether the attached device has isochronous endpoints
    pub fn set_isochronous(&self, isochronous: bool) {
        self.isochronous.store(isochronous, Ordering::Release);
    }

    pub fn is_isochronous(&self) -> bool {
        self.isochronous.load(Ordering::Acquire)
    }

    /// Whether a payload of `len` bytes qualifies for compression
    pub fn should_compress(&self, len: usize) -> bool {
        let Some(codec) = &self.codec else {
            return false;
        };
        let peer = Capabilities(self.peer_caps.load(Ordering::Acquire));

        !self.transport.is_local()
            && len > COMPRESS_THRESHOLD
            && peer.has(capability_for(codec.compression_type()))
            && !self.is_isochronous()
    }

    /// Compress `data` if that is allowed and actually makes it smaller
    fn try_compress(&self, data: &[u8]) -> Option<CompressedData> {
        if !self.should_compress(data.len()) {
            return None;
        }
        let codec = self.codec.as_ref()?;
        let uncompressed_size = u32::try_from(data.len()).ok()?;

        match codec.compress(data) {
            Some(compressed) if compressed.len() < data.len() => {
                trace!(
                    "Compressed {} bytes to {} bytes",
                    data.len(),
                    compressed.len()
                );
                Some(CompressedData::new(
                    codec.compression_type(),
                    uncompressed_size,
                    compressed,
                ))
            }
            Some(compressed) => {
                trace!(
                    "Compression did not help ({} -> {} bytes), sending raw",
                    data.len(),
                    compressed.len()
                );
                None
            }
            None => {
                trace!("Codec declined {} bytes, sending raw", data.len());
                None
            }
        }
    }
}

impl ChannelWriter for OutboundPath {
    fn write(&self, buffer: WriteBuffer) -> usize {
        let len = buffer.len();

        let result = match self.try_compress(buffer.as_slice()) {
            Some(compressed) => {
                let sent = self.transport.send(OutboundMessage::Compressed(compressed));
                // The original goes back to the bridge once the envelope is queued
                drop(buffer);
                sent
            }
            None => self.transport.send(OutboundMessage::Data(buffer)),
        };

        match result {
            Ok(()) => len,
            Err(e) => {
                warn!("Dropping {} byte outbound payload: {}", len, e);
                0
            }
        }
    }
}
