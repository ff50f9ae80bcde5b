//! Common building blocks for rust-usbredir
//!
//! This crate holds what the channel core shares with its collaborators:
//! the reference-counted device handle, the contracts of the device I/O
//! bridge and the permission gate, the blocking worker pool used for
//! attach/detach, error handling, logging setup, and test utilities.

pub mod backend;
pub mod error;
pub mod logging;
pub mod permission;
pub mod test_utils;
pub mod usb_types;
pub mod worker;

pub use backend::{
    AttachError, BackendContext, BackendError, BridgeReadError, BufferReturn, ChannelWriter,
    DeviceBridge, DeviceError, DeviceErrorKind, FilterRule, UsbBackend, WriteBuffer,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use permission::{
    PermissionCancel, PermissionError, PermissionGate, PermissionRequest, PermissionResponder,
    permission_request,
};
pub use usb_types::{BUS_NUMBER_FOR_EMULATED_USB, DeviceIdentity, UsbDevice};
pub use worker::{WorkerPool, WorkerTask};
