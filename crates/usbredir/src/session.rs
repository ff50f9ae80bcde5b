//! Session execution context
//!
//! The session owns the device registry. Channels never touch the registry
//! directly: they post a [`SessionEvent`] to the session's loop and wait for
//! the acknowledgement, so the registry only ever has one writer.

use crate::error::ChannelError;
use async_channel::{Receiver, Sender, bounded};
use common::{DeviceError, UsbDevice};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Receives unrecoverable device errors reported by channels
///
/// The registry decides whether and how the device is offered to the user
/// again.
pub trait DeviceRegistry: Send {
    fn notify_error(&mut self, device: &UsbDevice, error: &DeviceError);
}

/// Events posted from channels to the session context
#[derive(Debug)]
pub enum SessionEvent {
    /// A device failed and has already been disconnected
    DeviceError {
        device: UsbDevice,
        error: DeviceError,
        /// Completed once the registry has been notified
        ack: oneshot::Sender<()>,
    },
}

/// Handle channels use to talk to their session
#[derive(Clone)]
pub struct SessionHandle {
    event_tx: Sender<SessionEvent>,
    inhibit_tx: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    /// Post a device error and wait until the registry has seen it
    ///
    /// With `timeout` unset this waits indefinitely for the acknowledgement.
    pub async fn report_device_error(
        &self,
        device: UsbDevice,
        error: DeviceError,
        timeout: Option<Duration>,
    ) -> Result<(), ChannelError> {
        let (ack, acked) = oneshot::channel();
        self.event_tx
            .send(SessionEvent::DeviceError { device, error, ack })
            .await
            .map_err(|_| ChannelError::SessionClosed)?;

        match timeout {
            Some(limit) => tokio::time::timeout(limit, acked)
                .await
                .map_err(|_| ChannelError::AckTimeout)?
                .map_err(|_| ChannelError::SessionClosed),
            None => acked.await.map_err(|_| ChannelError::SessionClosed),
        }
    }

    /// Raise or lower the "inhibit keyboard grab" flag
    pub fn inhibit_keyboard_grab(&self, inhibit: bool) {
        let previous = self.inhibit_tx.send_replace(inhibit);
        if previous != inhibit {
            debug!("Keyboard grab inhibit: {}", inhibit);
        }
    }

    /// Current value of the keyboard grab inhibit flag
    pub fn keyboard_grab_inhibited(&self) -> bool {
        *self.inhibit_tx.borrow()
    }

    /// Watch changes of the keyboard grab inhibit flag
    pub fn subscribe_keyboard_grab(&self) -> watch::Receiver<bool> {
        self.inhibit_tx.subscribe()
    }
}

/// The session's single-writer loop around a [`DeviceRegistry`]
pub struct SessionContext<R> {
    registry: R,
    event_rx: Receiver<SessionEvent>,
}

impl<R: DeviceRegistry> SessionContext<R> {
    /// Process events until every [`SessionHandle`] is gone
    ///
    /// Returns the registry so callers can inspect it after shutdown.
    pub async fn run(mut self) -> R {
        while let Ok(event) = self.event_rx.recv().await {
            self.dispatch(event);
        }
        debug!("Session context stopped");
        self.registry
    }

    fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::DeviceError { device, error, ack } => {
                debug!("Delivering device error for {} to registry", device);
                self.registry.notify_error(&device, &error);
                if ack.send(()).is_err() {
                    debug!("Reporter for {} stopped waiting for the acknowledgement", device);
                }
            }
        }
    }
}

/// Create the link between channels and the session context
///
/// Returns (SessionHandle for channels, SessionContext to run on the session task)
pub fn create_session<R: DeviceRegistry>(registry: R) -> (SessionHandle, SessionContext<R>) {
    let (event_tx, event_rx) = bounded(64);
    let (inhibit_tx, _) = watch::channel(false);

    (
        SessionHandle {
            event_tx,
            inhibit_tx: Arc::new(inhibit_tx),
        },
        SessionContext { registry, event_rx },
    )
}

/// Registry that logs device errors and keeps them for inspection
#[derive(Clone, Default)]
pub struct RecordingRegistry {
    errors: Arc<Mutex<Vec<(UsbDevice, DeviceError)>>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors received so far, oldest first
    pub fn errors(&self) -> Vec<(UsbDevice, DeviceError)> {
        self.errors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl DeviceRegistry for RecordingRegistry {
    fn notify_error(&mut self, device: &UsbDevice, error: &DeviceError) {
        warn!("{}", error.message);
        self.errors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((device.clone(), error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::DeviceErrorKind;
    use common::test_utils::create_mock_device;

    fn lost(device: &UsbDevice) -> DeviceError {
        DeviceError::new(DeviceErrorKind::Lost, format!("{} lost", device))
    }

    #[tokio::test]
    async fn test_report_waits_for_registry() {
        let registry = RecordingRegistry::new();
        let (handle, context) = create_session(registry.clone());
        let task = tokio::spawn(context.run());

        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        handle
            .report_device_error(device.clone(), lost(&device), None)
            .await
            .unwrap();

        // Acknowledged means already recorded
        let errors = registry.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.same_device(&device));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_report_to_stopped_session() {
        let (handle, context) = create_session(RecordingRegistry::new());
        drop(context);

        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let result = handle.report_device_error(device.clone(), lost(&device), None).await;
        assert!(matches!(result, Err(ChannelError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        // Context never runs, but stays alive so the send succeeds
        let (handle, _context) = create_session(RecordingRegistry::new());

        let device = create_mock_device(1, 2, 0x1234, 0x5678);
        let result = handle
            .report_device_error(device.clone(), lost(&device), Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(ChannelError::AckTimeout)));
    }

    #[test]
    fn test_keyboard_grab_flag() {
        let (handle, _context) = create_session(RecordingRegistry::new());
        let mut watcher = handle.subscribe_keyboard_grab();

        assert!(!handle.keyboard_grab_inhibited());
        handle.inhibit_keyboard_grab(true);
        assert!(handle.keyboard_grab_inhibited());
        assert!(watcher.has_changed().unwrap());
        assert!(*watcher.borrow_and_update());

        handle.clone().inhibit_keyboard_grab(false);
        assert!(!handle.keyboard_grab_inhibited());
    }
}
