//! Device I/O bridge contract
//!
//! The bridge is the backend-side object that owns the live attachment to
//! one device and marshals bytes between the device driver and the channel.
//! The channel treats it as opaque: it attaches, detaches, feeds inbound
//! bytes, and receives outbound buffers through a [`ChannelWriter`].
//!
//! A bridge is created by a [`UsbBackend`] (the backend context) and is
//! destroyed by dropping it.

use crate::usb_types::UsbDevice;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Shared backend context; bridges are (re)built against it
pub type BackendContext = Arc<dyn UsbBackend>;

/// Factory for per-channel bridges
pub trait UsbBackend: Send + Sync {
    /// Construct a bridge that hands its outbound buffers to `writer`
    fn create_bridge(
        &self,
        writer: Arc<dyn ChannelWriter>,
    ) -> Result<Box<dyn DeviceBridge>, BackendError>;
}

/// Per-channel bridge
///
/// All calls are made with the channel's state lock held. `attach` and
/// `detach` may block (kernel claim/release) and are never called from the
/// channel's message-processing context.
pub trait DeviceBridge: Send {
    /// Attach `device`; on success the bridge holds the live attachment
    fn attach(&mut self, device: &UsbDevice) -> Result<(), AttachError>;

    /// Release the current attachment, if any
    fn detach(&mut self);

    /// Feed bytes received from the peer
    ///
    /// May synchronously produce outbound buffers through the writer.
    fn read(&mut self, data: &[u8]) -> Result<(), BridgeReadError>;

    /// Hand any queued outbound buffers to the writer
    fn flush_pending_writes(&mut self);

    /// Filter rules announced by the guest
    fn filter_rules(&self) -> Vec<FilterRule>;
}

/// Receives outbound buffers from the bridge
pub trait ChannelWriter: Send + Sync {
    /// Queue `buffer` for sending; returns the number of bytes accepted
    fn write(&self, buffer: WriteBuffer) -> usize;
}

/// Takes back buffers the bridge handed to the writer
pub trait BufferReturn: Send + Sync {
    fn return_buffer(&self, data: Vec<u8>);
}

/// An outbound buffer lent by the bridge
///
/// Ownership returns to the bridge when the buffer is dropped, which the
/// channel only does once the transport has queued (or finished) the send.
pub struct WriteBuffer {
    data: Vec<u8>,
    owner: Option<Arc<dyn BufferReturn>>,
}

impl WriteBuffer {
    /// Buffer that goes back to `owner` when dropped
    pub fn lent(data: Vec<u8>, owner: Arc<dyn BufferReturn>) -> Self {
        Self {
            data,
            owner: Some(owner),
        }
    }

    /// Buffer with no owner to return to
    pub fn owned(data: Vec<u8>) -> Self {
        Self { data, owner: None }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for WriteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("len", &self.data.len())
            .field("lent", &self.owner.is_some())
            .finish()
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.return_buffer(std::mem::take(&mut self.data));
        }
    }
}

/// A guest-side redirection filter rule; `None` fields match anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterRule {
    pub device_class: Option<u8>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub device_version_bcd: Option<u16>,
    pub allow: bool,
}

/// Failure constructing a bridge
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Out of memory initializing redirection support")]
    OutOfMemory,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Failure attaching a device to the bridge
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("Error attaching device: {0}")]
    Failed(String),

    #[error("Error attaching device: (no error information)")]
    Unknown,
}

/// Non-zero status returned by [`DeviceBridge::read`]
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum BridgeReadError {
    #[error("usbredir I/O error")]
    Io,

    #[error("usbredir protocol parse error")]
    Parse,

    #[error("device rejected by host")]
    DeviceRejected,

    #[error("device lost")]
    DeviceLost,

    #[error("bridge error code {0}")]
    Other(i32),
}

impl BridgeReadError {
    /// Numeric status as reported by the redirection library
    pub fn code(self) -> i32 {
        match self {
            BridgeReadError::Io => -1,
            BridgeReadError::Parse => -2,
            BridgeReadError::DeviceRejected => -3,
            BridgeReadError::DeviceLost => -4,
            BridgeReadError::Other(code) => code,
        }
    }

    /// Diagnostic for a device described by `desc`
    pub fn describe(self, desc: &str) -> DeviceError {
        match self {
            BridgeReadError::Parse => DeviceError::new(
                DeviceErrorKind::Failed,
                format!("usbredir protocol parse error for {}", desc),
            ),
            BridgeReadError::DeviceRejected => {
                DeviceError::new(DeviceErrorKind::Rejected, format!("{} rejected by host", desc))
            }
            BridgeReadError::DeviceLost => DeviceError::new(
                DeviceErrorKind::Lost,
                format!("{} disconnected (fatal IO error)", desc),
            ),
            other => DeviceError::new(
                DeviceErrorKind::Failed,
                format!("Unknown error ({}) for {}", other.code(), desc),
            ),
        }
    }
}

/// Category of an unrecoverable device error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    Failed,
    Rejected,
    Lost,
}

/// Error reported to the session's device registry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
