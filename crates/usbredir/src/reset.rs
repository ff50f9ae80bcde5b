//! Channel lifecycle hooks and reset sequencing

use crate::channel::UsbredirChannel;
use crate::state::ChannelState;
use protocol::{Capabilities, Capability};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Hooks the session layer drives on every channel
pub trait ChannelLifecycle {
    /// The transport is up and messages may flow
    fn on_ready(&self);

    /// The protocol state is being reset (e.g. on migration)
    ///
    /// Completes once the channel is back in a state where it can connect.
    fn on_reset(self: Arc<Self>, migrating: bool) -> impl Future<Output = ()> + Send;
}

/// State every channel type shares: negotiated capabilities and reset count
#[derive(Debug, Default)]
pub struct ChannelBase {
    local_caps: AtomicU32,
    peer_caps: Arc<AtomicU32>,
    resets: AtomicU64,
}

impl ChannelBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_capability(&self, cap: Capability) {
        self.local_caps
            .fetch_or(Capabilities::empty().with(cap).0, Ordering::AcqRel);
    }

    pub fn local_capabilities(&self) -> Capabilities {
        Capabilities(self.local_caps.load(Ordering::Acquire))
    }

    pub fn set_peer_capabilities(&self, caps: Capabilities) {
        self.peer_caps.store(caps.0, Ordering::Release);
    }

    pub fn peer_capabilities(&self) -> Capabilities {
        Capabilities(self.peer_caps.load(Ordering::Acquire))
    }

    /// Shared view of the peer capabilities for the outbound path
    pub(crate) fn peer_caps_handle(&self) -> Arc<AtomicU32> {
        self.peer_caps.clone()
    }

    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Acquire)
    }

    /// Forget everything negotiated with the peer
    pub fn reset(&self, migrating: bool) {
        self.peer_caps.store(0, Ordering::Release);
        let count = self.resets.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Channel reset #{} (migrating: {})", count, migrating);
    }
}

impl UsbredirChannel {
    /// Destroy the bridge and construct a new one against the same context
    fn rebuild_bridge(&self) {
        let mut inner = self.lock();
        let Some(context) = inner.context.clone() else {
            return;
        };

        // A connect may have landed since the reset's disconnect
        if inner.state == ChannelState::Connected {
            if let Some(device) = self.disconnect_locked(&mut inner) {
                info!("Released {} before rebuilding the bridge", device);
            }
        }

        inner.bridge = None;
        match context.create_bridge(self.writer()) {
            Ok(bridge) => {
                inner.bridge = Some(bridge);
                debug!("Device bridge rebuilt");
            }
            Err(e) => error!("Failed to rebuild device bridge: {}", e),
        }
    }
}

impl ChannelLifecycle for UsbredirChannel {
    fn on_ready(&self) {
        if let Some(bridge) = self.lock().bridge.as_mut() {
            bridge.flush_pending_writes();
        }
    }

    async fn on_reset(self: Arc<Self>, migrating: bool) {
        let (bound, connected) = {
            let inner = self.lock();
            (inner.bridge.is_some(), inner.state == ChannelState::Connected)
        };

        if bound {
            if connected {
                info!("Resetting channel with a device attached, disconnecting first");
                if let Err(e) = self.disconnect_device_async().await {
                    warn!("Async disconnect failed during reset: {}", e);
                    self.disconnect_device();
                }
            }
            self.rebuild_bridge();
        }

        self.base.reset(migrating);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::error::TransportError;
    use crate::outbound::{OutboundMessage, Transport};
    use crate::session::{RecordingRegistry, create_session};
    use common::WorkerPool;
    use common::test_utils::{MockBackend, create_mock_device};

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _message: OutboundMessage) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_local(&self) -> bool {
            false
        }
    }

    fn bound_channel() -> (Arc<UsbredirChannel>, MockBackend) {
        let (session, _context) = create_session(RecordingRegistry::new());
        let pool = Arc::new(WorkerPool::new("reset-test", 1).unwrap());
        let channel =
            UsbredirChannel::new(ChannelOptions::default(), pool, session, Arc::new(NullTransport));
        let backend = MockBackend::new();
        channel.set_context(Arc::new(backend.clone())).unwrap();
        (channel, backend)
    }

    #[tokio::test]
    async fn test_rebuild_detaches_late_connect() {
        let (channel, backend) = bound_channel();
        let device = create_mock_device(1, 2, 0x1234, 0x5678);

        // Connected again by the time the bridge is rebuilt
        channel.connect_device(device.clone()).await.unwrap();
        channel.rebuild_bridge();

        let log = backend.log();
        assert_eq!(log.detach_calls, 1);
        assert_eq!(log.destroyed_while_attached, 0);
        assert_eq!(log.created, 2);
        drop(log);

        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.device().is_none());
        assert_eq!(device.handle_count(), 1);
    }

    #[test]
    fn test_base_reset_forgets_peer() {
        let base = ChannelBase::new();
        base.set_local_capability(Capability::DataCompressLz4);
        base.set_peer_capabilities(Capabilities::empty().with(Capability::DataCompressLz4));

        base.reset(false);

        assert!(base.local_capabilities().has(Capability::DataCompressLz4));
        assert!(!base.peer_capabilities().has(Capability::DataCompressLz4));
        assert_eq!(base.reset_count(), 1);
    }

    #[test]
    fn test_peer_handle_tracks_base() {
        let base = ChannelBase::new();
        let handle = base.peer_caps_handle();

        base.set_peer_capabilities(Capabilities(0b1));
        assert_eq!(handle.load(Ordering::Acquire), 0b1);
    }
}
