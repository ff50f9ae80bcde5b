//! The USB redirection channel
//!
//! A channel redirects at most one device at a time. All lifecycle state and
//! every call into the device bridge sit behind one mutex, which is held for
//! the duration of a single operation and never across an `.await`.

use crate::config::ChannelSettings;
use crate::error::{ChannelError, Result};
use crate::outbound::{OutboundPath, Transport, capability_for};
use crate::reset::ChannelBase;
use crate::session::SessionHandle;
use crate::state::ChannelState;
use common::{
    BackendContext, ChannelWriter, DeviceBridge, FilterRule, PermissionCancel, PermissionGate,
    UsbDevice, WorkerPool,
};
use protocol::{BlockCodec, Capabilities, Lz4Codec};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Everything guarded by the channel lock
pub(crate) struct ChannelInner {
    pub(crate) state: ChannelState,
    /// Attached device, or the one a connect is in flight for
    pub(crate) device: Option<UsbDevice>,
    /// Present iff a backend context has been bound
    pub(crate) bridge: Option<Box<dyn DeviceBridge>>,
    pub(crate) context: Option<BackendContext>,
    pub(crate) permission_cancel: Option<PermissionCancel>,
}

/// Optional collaborators, resolved once at construction
#[derive(Clone, Default)]
pub struct ChannelOptions {
    /// Permission check for physically present devices
    pub gate: Option<Arc<dyn PermissionGate>>,
    /// Block codec for compressed payloads in both directions
    pub codec: Option<Arc<dyn BlockCodec>>,
    /// How long a device error report waits for the session (None = forever)
    pub error_ack_timeout: Option<Duration>,
}

impl ChannelOptions {
    /// Options as described by the `[channel]` config section
    pub fn from_settings(settings: &ChannelSettings) -> Self {
        let codec: Option<Arc<dyn BlockCodec>> = if settings.compression {
            Some(Arc::new(Lz4Codec))
        } else {
            None
        };

        Self {
            gate: None,
            codec,
            error_ack_timeout: settings.error_ack_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

/// Client side of a USB redirection channel
pub struct UsbredirChannel {
    pub(crate) inner: Mutex<ChannelInner>,
    pub(crate) base: ChannelBase,
    pub(crate) outbound: Arc<OutboundPath>,
    pub(crate) gate: Option<Arc<dyn PermissionGate>>,
    pub(crate) codec: Option<Arc<dyn BlockCodec>>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) session: SessionHandle,
    pub(crate) error_ack_timeout: Option<Duration>,
}

impl UsbredirChannel {
    /// Create an unbound channel
    ///
    /// The channel cannot connect devices until [`set_context`](Self::set_context)
    /// binds a backend.
    pub fn new(
        options: ChannelOptions,
        pool: Arc<WorkerPool>,
        session: SessionHandle,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let base = ChannelBase::new();
        let outbound = Arc::new(OutboundPath::new(
            transport,
            options.codec.clone(),
            base.peer_caps_handle(),
        ));

        Arc::new(Self {
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Disconnected,
                device: None,
                bridge: None,
                context: None,
                permission_cancel: None,
            }),
            base,
            outbound,
            gate: options.gate,
            codec: options.codec,
            pool,
            session,
            error_ack_timeout: options.error_ack_timeout,
        })
    }

    /// Bind the backend context and create the device bridge
    ///
    /// A channel is bound once; failure to create the bridge is fatal for it.
    pub fn set_context(&self, context: BackendContext) -> Result<()> {
        let mut inner = self.lock();
        if inner.bridge.is_some() {
            return Err(ChannelError::AlreadyBound);
        }

        let bridge = context.create_bridge(self.writer())?;
        inner.bridge = Some(bridge);
        inner.context = Some(context);
        drop(inner);

        if let Some(codec) = &self.codec {
            self.base
                .set_local_capability(capability_for(codec.compression_type()));
        }

        info!("USB redirection backend bound");
        Ok(())
    }

    /// Filter rules the guest side applies to auto-redirected devices
    pub fn guest_filter(&self) -> Result<Vec<FilterRule>> {
        self.lock()
            .bridge
            .as_ref()
            .map(|bridge| bridge.filter_rules())
            .ok_or(ChannelError::NoBackend)
    }

    /// The attached device, or the one a connect is in flight for
    pub fn device(&self) -> Option<UsbDevice> {
        self.lock().device.clone()
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    /// State and device, read under one lock acquisition
    pub fn status(&self) -> (ChannelState, Option<UsbDevice>) {
        let inner = self.lock();
        (inner.state, inner.device.clone())
    }

    /// Whether a backend has been bound
    pub fn has_backend(&self) -> bool {
        self.lock().bridge.is_some()
    }

    /// Record the capability bits the peer advertised
    pub fn set_peer_capabilities(&self, caps: Capabilities) {
        debug!("Peer capabilities: {:#x}", caps.0);
        self.base.set_peer_capabilities(caps);
    }

    pub fn peer_capabilities(&self) -> Capabilities {
        self.base.peer_capabilities()
    }

    /// Capability bits this channel advertises
    pub fn local_capabilities(&self) -> Capabilities {
        self.base.local_capabilities()
    }

    /// Number of completed resets
    pub fn reset_count(&self) -> u64 {
        self.base.reset_count()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn writer(&self) -> Arc<dyn ChannelWriter> {
        self.outbound.clone()
    }
}

impl Drop for UsbredirChannel {
    fn drop(&mut self) {
        let mut inner = self.lock();
        let released = self.disconnect_locked(&mut inner);
        inner.bridge = None;
        inner.context = None;
        drop(inner);

        if let Some(device) = released {
            debug!("Released {} on channel teardown", device);
        }
    }
}
