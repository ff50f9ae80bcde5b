//! Error types for the redirection channel

use common::BackendError;
use protocol::ProtocolError;
use thiserror::Error;

/// Outcome of a failed connect request
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// No backend context has been bound to the channel
    #[error("No USB backend bound to the channel")]
    NoBackend,

    /// Another device is attached or a connect is already in progress
    #[error("Channel busy: a device is already connected or connecting")]
    Busy,

    /// The permission gate refused access to the device node
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The bridge could not claim the device
    #[error("Attach failed: {0}")]
    AttachFailure(String),

    /// The request was abandoned by a concurrent disconnect
    #[error("Connect cancelled")]
    Cancelled,
}

/// Errors raised by the channel outside the connect path
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("No USB backend bound to the channel")]
    NoBackend,

    #[error("A backend is already bound to the channel")]
    AlreadyBound,

    /// An inbound message was malformed and has been dropped
    #[error("Parse error: {0}")]
    ParseError(#[from] ProtocolError),

    #[error("Failed to create device bridge: {0}")]
    BridgeCreation(#[from] BackendError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Worker error: {0}")]
    Worker(#[from] common::Error),

    /// The session context stopped before acknowledging a device error
    #[error("Session context closed")]
    SessionClosed,

    #[error("Timed out waiting for the session to acknowledge a device error")]
    AckTimeout,
}

/// Failures handing an outbound message to the transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
