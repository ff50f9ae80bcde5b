//! Wire protocol for the USB redirection channel
//!
//! This crate defines the messages exchanged between the client-side USB
//! redirection channel and the VM peer, the capability bits negotiated on
//! channel setup, the optional block compression codec, and length-prefixed
//! framing using postcard.
//!
//! # Example
//!
//! ```
//! use protocol::{Message, VmcMessage, CURRENT_VERSION};
//! use protocol::{encode_message, decode_message};
//!
//! let msg = Message {
//!     version: CURRENT_VERSION,
//!     payload: VmcMessage::Data { data: vec![1, 2, 3] },
//! };
//!
//! let bytes = encode_message(&msg).unwrap();
//! let decoded = decode_message(&bytes).unwrap();
//! assert_eq!(decoded.version, CURRENT_VERSION);
//! ```
//!
//! # Compressed payloads
//!
//! ```
//! use protocol::{BlockCodec, CompressedData, Lz4Codec};
//!
//! let codec = Lz4Codec;
//! let payload = vec![7u8; 4096];
//! let compressed = codec.compress(&payload).unwrap();
//! let envelope = CompressedData::new(codec.compression_type(), payload.len() as u32, compressed);
//!
//! let restored = envelope.decompress(Some(&codec)).unwrap();
//! assert_eq!(restored, payload);
//! ```

pub mod caps;
pub mod codec;
pub mod compression;
pub mod error;
pub mod messages;
pub mod version;

pub use caps::{Capabilities, Capability};
pub use codec::{
    MAX_FRAME_SIZE, decode_framed, decode_message, encode_framed, encode_message, read_framed,
    validate_version, write_framed,
};

#[cfg(feature = "async")]
pub use codec::{read_framed_async, write_framed_async};
pub use compression::{BlockCodec, CompressionType, Lz4Codec};
pub use error::{ProtocolError, Result};
pub use messages::{CompressedData, Message, VmcMessage};
pub use version::{CURRENT_VERSION, ProtocolVersion};
