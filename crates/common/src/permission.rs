//! Permission gate contract
//!
//! Physically present devices may need an out-of-process helper to grant
//! this process access to the device node before the bridge can claim it.
//! A request is a pair of one-shot channels: the outcome flows from the
//! gate to the channel, a cancellation flows the other way.

use thiserror::Error;
use tokio::sync::oneshot;

/// Capability-check subsystem for physically present devices
pub trait PermissionGate: Send + Sync {
    /// Start an access check for the device node at `bus`/`address`
    fn request(&self, bus: u16, address: u16) -> PermissionRequest;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("Permission denied: {0}")]
    Denied(String),

    #[error("Permission request cancelled")]
    Cancelled,

    #[error("Permission helper failed: {0}")]
    HelperFailed(String),
}

/// Create a connected request/responder pair
pub fn permission_request() -> (PermissionRequest, PermissionResponder) {
    let (result_tx, result_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();

    (
        PermissionRequest {
            outcome: result_rx,
            cancel: PermissionCancel {
                tx: Some(cancel_tx),
            },
        },
        PermissionResponder {
            result: result_tx,
            cancel: cancel_rx,
            cancelled: false,
        },
    )
}

/// Requesting side of a pending permission check
#[derive(Debug)]
pub struct PermissionRequest {
    /// Resolves once the gate answers
    pub outcome: oneshot::Receiver<Result<(), PermissionError>>,
    /// Asks the gate to stop
    pub cancel: PermissionCancel,
}

impl PermissionRequest {
    /// Wait for the gate's answer
    ///
    /// A gate that goes away without answering counts as a helper failure.
    pub async fn wait(outcome: oneshot::Receiver<Result<(), PermissionError>>) -> Result<(), PermissionError> {
        outcome.await.unwrap_or_else(|_| {
            Err(PermissionError::HelperFailed(
                "permission helper exited without answering".to_string(),
            ))
        })
    }
}

/// Cooperative cancellation handle for a pending request
#[derive(Debug)]
pub struct PermissionCancel {
    tx: Option<oneshot::Sender<()>>,
}

impl PermissionCancel {
    /// Signal the gate; later calls are no-ops
    pub fn cancel(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_none()
    }
}

/// Gate side of a pending permission check
#[derive(Debug)]
pub struct PermissionResponder {
    result: oneshot::Sender<Result<(), PermissionError>>,
    cancel: oneshot::Receiver<()>,
    cancelled: bool,
}

impl PermissionResponder {
    /// Whether the requester asked to cancel
    pub fn is_cancelled(&mut self) -> bool {
        if !self.cancelled {
            self.cancelled = self.cancel.try_recv().is_ok();
        }
        self.cancelled
    }

    /// Deliver the outcome; ignored if the requester is gone
    pub fn respond(self, result: Result<(), PermissionError>) {
        let _ = self.result.send(result);
    }

    pub fn grant(self) {
        self.respond(Ok(()));
    }

    pub fn deny(self, reason: impl Into<String>) {
        self.respond(Err(PermissionError::Denied(reason.into())));
    }
}
