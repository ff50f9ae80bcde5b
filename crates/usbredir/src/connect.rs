//! Connect and disconnect orchestration
//!
//! Attaching a device can block inside the kernel, so the attach always runs
//! on the worker pool. Physically present devices first go through the
//! permission gate when one is installed; a disconnect arriving during that
//! wait cancels the request and the connect resolves to `Cancelled`.

use crate::channel::{ChannelInner, UsbredirChannel};
use crate::error::{ChannelError, ConnectError};
use crate::state::ChannelState;
use common::{PermissionError, PermissionRequest, UsbDevice};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type PermissionOutcome = oneshot::Receiver<Result<(), PermissionError>>;

/// Rolls a connect back to `Disconnected` unless it completed
///
/// Also covers a connect future dropped before it resolved.
struct PendingConnect<'a> {
    channel: &'a UsbredirChannel,
    device: UsbDevice,
    completed: bool,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.channel.abandon_connect(&self.device);
        }
    }
}

/// Lowers the keyboard grab inhibit flag however the wait ends
struct InhibitGuard<'a>(&'a UsbredirChannel);

impl<'a> InhibitGuard<'a> {
    fn raise(channel: &'a UsbredirChannel) -> Self {
        channel.session.inhibit_keyboard_grab(true);
        Self(channel)
    }
}

impl Drop for InhibitGuard<'_> {
    fn drop(&mut self) {
        self.0.session.inhibit_keyboard_grab(false);
    }
}

impl UsbredirChannel {
    /// Attach `device` to this channel
    ///
    /// Fails with `Busy` unless the channel is idle. On any failure the
    /// channel is back in `Disconnected` and holds no device reference.
    pub async fn connect_device(self: &Arc<Self>, device: UsbDevice) -> Result<(), ConnectError> {
        let pending = {
            let mut inner = self.lock();
            if inner.bridge.is_none() {
                return Err(ConnectError::NoBackend);
            }
            if !inner.state.can_connect() || inner.device.is_some() {
                debug!("Rejecting connect of {}: channel is {}", device, inner.state);
                return Err(ConnectError::Busy);
            }

            inner.device = Some(device.clone());
            match &self.gate {
                Some(gate) if !device.is_emulated() => {
                    let request = gate.request(device.bus(), device.address());
                    inner.state = ChannelState::WaitingForPermission;
                    inner.permission_cancel = Some(request.cancel);
                    Some(request.outcome)
                }
                _ => None,
            }
        };

        let mut guard = PendingConnect {
            channel: self,
            device: device.clone(),
            completed: false,
        };

        let result = match pending {
            Some(outcome) => self.connect_after_permission(&device, outcome).await,
            None => {
                self.attach_on_worker(&device, ChannelState::Disconnected)
                    .await
            }
        };

        match &result {
            Ok(()) => {
                guard.completed = true;
                info!("Connected {}", device);
            }
            Err(ConnectError::Cancelled) => info!("Connect of {} cancelled", device),
            Err(e) => warn!("Failed to connect {}: {}", device, e),
        }
        result
    }

    async fn connect_after_permission(
        self: &Arc<Self>,
        device: &UsbDevice,
        outcome: PermissionOutcome,
    ) -> Result<(), ConnectError> {
        let _inhibit = InhibitGuard::raise(self);
        debug!("Waiting for permission to access {}", device);

        let verdict = PermissionRequest::wait(outcome).await;

        if self.lock().state == ChannelState::Disconnecting {
            return Err(ConnectError::Cancelled);
        }
        match verdict {
            Ok(()) => {
                self.attach_on_worker(device, ChannelState::WaitingForPermission)
                    .await
            }
            Err(PermissionError::Cancelled) => Err(ConnectError::Cancelled),
            Err(e) => Err(ConnectError::PermissionDenied(e.to_string())),
        }
    }

    /// Run the blocking attach on the worker pool
    ///
    /// The worker only attaches if the channel is still in `expected`.
    async fn attach_on_worker(
        self: &Arc<Self>,
        device: &UsbDevice,
        expected: ChannelState,
    ) -> Result<(), ConnectError> {
        let channel = Arc::clone(self);
        let device = device.clone();

        self.pool
            .submit(move || channel.open_device(&device, expected))
            .await
            .map_err(|e| ConnectError::AttachFailure(e.to_string()))?
    }

    fn open_device(&self, device: &UsbDevice, expected: ChannelState) -> Result<(), ConnectError> {
        let mut inner = self.lock();
        let still_wanted = inner
            .device
            .as_ref()
            .is_some_and(|held| held.same_device(device));
        if inner.state != expected || !inner.state.can_attach() || !still_wanted {
            return Err(ConnectError::Cancelled);
        }

        let bridge = inner.bridge.as_mut().ok_or(ConnectError::NoBackend)?;
        bridge
            .attach(device)
            .map_err(|e| ConnectError::AttachFailure(e.to_string()))?;

        inner.state = ChannelState::Connected;
        inner.permission_cancel = None;
        self.outbound.set_isochronous(device.is_isochronous());
        debug!("Attached {} to bridge", device);
        Ok(())
    }

    /// Undo a connect that did not complete
    fn abandon_connect(&self, device: &UsbDevice) {
        let mut inner = self.lock();
        if inner.state == ChannelState::Connected {
            return;
        }
        if inner
            .device
            .as_ref()
            .is_some_and(|held| held.same_device(device))
        {
            inner.device = None;
        }
        inner.state = ChannelState::Disconnected;
        if let Some(mut cancel) = inner.permission_cancel.take() {
            cancel.cancel();
        }
    }

    /// Detach the current device, if any
    ///
    /// Synchronous and idempotent. A pending permission request is cancelled
    /// instead; the connect waiting on it resolves to `Cancelled`.
    pub fn disconnect_device(&self) {
        let released = {
            let mut inner = self.lock();
            self.disconnect_locked(&mut inner)
        };
        if let Some(device) = released {
            info!("Disconnected {}", device);
        }
    }

    /// [`disconnect_device`](Self::disconnect_device) on the worker pool
    pub async fn disconnect_device_async(self: &Arc<Self>) -> Result<(), ChannelError> {
        let channel = Arc::clone(self);
        self.pool.submit(move || channel.disconnect_device()).await?;
        Ok(())
    }

    /// Disconnect with the lock already held; returns the released device
    pub(crate) fn disconnect_locked(&self, inner: &mut ChannelInner) -> Option<UsbDevice> {
        match inner.state {
            ChannelState::Disconnected | ChannelState::Disconnecting => None,
            ChannelState::WaitingForPermission => {
                debug!("Disconnect while waiting for permission, cancelling request");
                inner.state = ChannelState::Disconnecting;
                if let Some(mut cancel) = inner.permission_cancel.take() {
                    cancel.cancel();
                }
                None
            }
            ChannelState::Connected => {
                if let Some(bridge) = inner.bridge.as_mut() {
                    bridge.detach();
                }
                inner.state = ChannelState::Disconnected;
                self.outbound.set_isochronous(false);
                inner.device.take()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::error::TransportError;
    use crate::outbound::{OutboundMessage, Transport};
    use crate::session::{RecordingRegistry, SessionHandle, create_session};
    use common::test_utils::{
        DEFAULT_TEST_TIMEOUT, MockBackend, MockPermissionGate, create_emulated_device,
        create_isochronous_device, create_mock_device, with_timeout,
    };
    use common::{AttachError, WorkerPool};

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _message: OutboundMessage) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_local(&self) -> bool {
            false
        }
    }

    fn setup(
        gate: Option<MockPermissionGate>,
    ) -> (Arc<UsbredirChannel>, MockBackend, SessionHandle) {
        let (session, _context) = create_session(RecordingRegistry::new());
        let pool = Arc::new(WorkerPool::new("connect-test", 2).unwrap());
        let mut options = ChannelOptions::default();
        if let Some(gate) = gate {
            options = options.with_gate(Arc::new(gate));
        }

        let channel = UsbredirChannel::new(options, pool, session.clone(), Arc::new(NullTransport));
        let backend = MockBackend::new();
        channel.set_context(Arc::new(backend.clone())).unwrap();
        (channel, backend, session)
    }

    #[tokio::test]
    async fn test_connect_without_backend() {
        let (session, _context) = create_session(RecordingRegistry::new());
        let pool = Arc::new(WorkerPool::new("connect-test", 1).unwrap());
        let channel =
            UsbredirChannel::new(ChannelOptions::default(), pool, session, Arc::new(NullTransport));

        let result = channel
            .connect_device(create_mock_device(1, 2, 3, 4))
            .await;
        assert_eq!(result, Err(ConnectError::NoBackend));
        assert!(channel.device().is_none());
    }

    #[tokio::test]
    async fn test_direct_connect_and_disconnect() {
        let (channel, backend, _session) = setup(None);
        let device = create_mock_device(1, 2, 0x1234, 0x5678);

        channel.connect_device(device.clone()).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);
        assert!(channel.device().unwrap().same_device(&device));
        assert_eq!(backend.log().attached.len(), 1);

        channel.disconnect_device();
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.device().is_none());
        assert_eq!(backend.log().detach_calls, 1);
    }

    #[tokio::test]
    async fn test_attach_failure_releases_device() {
        let (channel, backend, _session) = setup(None);
        backend.log().fail_next_attach = Some(AttachError::Failed("claim failed".into()));
        let device = create_mock_device(1, 2, 0x1234, 0x5678);

        let result = channel.connect_device(device.clone()).await;
        assert!(matches!(result, Err(ConnectError::AttachFailure(_))));
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.device().is_none());
        assert_eq!(device.handle_count(), 1);
    }

    #[tokio::test]
    async fn test_isochronous_flag_follows_device() {
        let (channel, _backend, _session) = setup(None);

        channel
            .connect_device(create_isochronous_device(1, 5))
            .await
            .unwrap();
        assert!(channel.outbound.is_isochronous());

        channel.disconnect_device();
        assert!(!channel.outbound.is_isochronous());
    }

    #[tokio::test]
    async fn test_gate_grant_connects() {
        let gate = MockPermissionGate::new();
        let (channel, _backend, session) = setup(Some(gate.clone()));
        let device = create_mock_device(3, 4, 0x1234, 0x5678);

        let task = tokio::spawn({
            let channel = channel.clone();
            let device = device.clone();
            async move { channel.connect_device(device).await }
        });

        with_timeout(DEFAULT_TEST_TIMEOUT, gate.wait_for_pending(1))
            .await
            .unwrap();
        assert_eq!(channel.state(), ChannelState::WaitingForPermission);
        assert!(session.keyboard_grab_inhibited());

        gate.grant_next();
        with_timeout(DEFAULT_TEST_TIMEOUT, task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(channel.state(), ChannelState::Connected);
        assert!(!session.keyboard_grab_inhibited());
    }

    #[tokio::test]
    async fn test_gate_denial() {
        let gate = MockPermissionGate::new();
        let (channel, backend, session) = setup(Some(gate.clone()));
        let device = create_mock_device(3, 4, 0x1234, 0x5678);

        let task = tokio::spawn({
            let channel = channel.clone();
            let device = device.clone();
            async move { channel.connect_device(device).await }
        });
        with_timeout(DEFAULT_TEST_TIMEOUT, gate.wait_for_pending(1))
            .await
            .unwrap();
        gate.deny_next("not in plugdev");

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectError::PermissionDenied(_))));
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.device().is_none());
        assert!(backend.log().attached.is_empty());
        assert!(!session.keyboard_grab_inhibited());
        assert_eq!(device.handle_count(), 1);
    }

    #[tokio::test]
    async fn test_emulated_device_skips_gate() {
        let gate = MockPermissionGate::new();
        let (channel, _backend, _session) = setup(Some(gate.clone()));

        channel
            .connect_device(create_emulated_device(1))
            .await
            .unwrap();
        assert_eq!(gate.request_count(), 0);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_async_detaches() {
        let (channel, backend, _session) = setup(None);
        channel
            .connect_device(create_mock_device(1, 2, 3, 4))
            .await
            .unwrap();

        channel.disconnect_device_async().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(backend.log().detach_calls, 1);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let (channel, backend, _session) = setup(None);

        channel.disconnect_device();
        channel.disconnect_device();

        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(backend.log().detach_calls, 0);
    }
}
