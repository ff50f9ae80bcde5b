//! USB redirection channel
//!
//! The client side of a channel that redirects one USB device at a time to a
//! virtual machine peer. The channel binds a backend context to create its
//! device bridge, connects and disconnects devices (optionally through a
//! permission gate, always attaching on a worker thread), feeds peer messages
//! to the bridge, and compresses what the bridge writes back when the peer
//! supports it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use common::WorkerPool;
//! use common::test_utils::create_emulated_device;
//! use usbredir::{ChannelOptions, FramedTransport, RecordingRegistry, UsbredirChannel};
//! use usbredir::{create_session, loopback::LoopbackBackend};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let (session, context) = create_session(RecordingRegistry::new());
//! tokio::spawn(context.run());
//!
//! let (client, _peer) = tokio::io::duplex(64 * 1024);
//! let (transport, _writer) = FramedTransport::spawn(client, false);
//! let pool = Arc::new(WorkerPool::new("usbredir-worker", 2)?);
//!
//! let channel = UsbredirChannel::new(ChannelOptions::default(), pool, session, Arc::new(transport));
//! channel.set_context(Arc::new(LoopbackBackend::new(Vec::new())))?;
//! channel.connect_device(create_emulated_device(1)).await?;
//! channel.disconnect_device();
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connect;
pub mod error;
pub mod inbound;
pub mod loopback;
pub mod outbound;
pub mod reset;
pub mod session;
pub mod state;
pub mod transport;

pub use channel::{ChannelOptions, UsbredirChannel};
pub use config::RedirConfig;
pub use error::{ChannelError, ConnectError, Result, TransportError};
pub use outbound::{COMPRESS_THRESHOLD, OutboundMessage, OutboundPath, Transport};
pub use reset::{ChannelBase, ChannelLifecycle};
pub use session::{
    DeviceRegistry, RecordingRegistry, SessionContext, SessionEvent, SessionHandle, create_session,
};
pub use state::ChannelState;
pub use transport::{FramedTransport, pump_inbound};
