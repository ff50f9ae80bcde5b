//! Test utilities for rust-usbredir
//!
//! Provides mock collaborators (backend, bridge, permission gate) and helper
//! functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device;
//!
//! let device = create_mock_device(1, 4, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id(), 0x1234);
//! assert!(!device.is_emulated());
//! ```

use crate::backend::{
    AttachError, BackendError, BridgeReadError, BufferReturn, ChannelWriter, DeviceBridge,
    FilterRule, UsbBackend, WriteBuffer,
};
use crate::permission::{PermissionGate, PermissionRequest, PermissionResponder, permission_request};
use crate::usb_types::{BUS_NUMBER_FOR_EMULATED_USB, DeviceIdentity, UsbDevice};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a physically present mock device
pub fn create_mock_device(bus: u16, address: u16, vendor_id: u16, product_id: u16) -> UsbDevice {
    UsbDevice::new(DeviceIdentity {
        bus,
        address,
        vendor_id,
        product_id,
        isochronous: false,
        manufacturer: Some("Test Manufacturer".to_string()),
        product: Some(format!("Test Product {:04x}", product_id)),
    })
}

/// Create a software-emulated device (bypasses the permission gate)
pub fn create_emulated_device(address: u16) -> UsbDevice {
    UsbDevice::new(DeviceIdentity {
        bus: BUS_NUMBER_FOR_EMULATED_USB,
        address,
        vendor_id: 0x2b23,
        product_id: 0xcdcd,
        isochronous: false,
        manufacturer: Some("Emulated".to_string()),
        product: Some("CD-ROM".to_string()),
    })
}

/// Create a device with an isochronous endpoint (webcam-like)
pub fn create_isochronous_device(bus: u16, address: u16) -> UsbDevice {
    UsbDevice::new(DeviceIdentity {
        bus,
        address,
        vendor_id: 0x046d,
        product_id: 0x0825,
        isochronous: true,
        manufacturer: Some("Test Manufacturer".to_string()),
        product: Some("Webcam".to_string()),
    })
}

/// Create payload data with a repeating pattern (compresses well)
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Create payload data that does not compress (xorshift noise)
pub fn create_incompressible_data(size: usize) -> Vec<u8> {
    let mut state: u32 = 0x9E37_79B9;
    (0..size)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Run a future with timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, &'static str>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| "Test timed out")
}

// ============================================================================
// Mock backend and bridge
// ============================================================================

/// Everything the mock bridges observed, plus scripted behaviour
#[derive(Debug, Default)]
pub struct MockBridgeLog {
    /// Bridges constructed by the backend
    pub created: usize,
    /// Bridges dropped
    pub destroyed: usize,
    /// (bus, address) of successful attaches, in order
    pub attached: Vec<(u16, u16)>,
    /// Number of detach calls
    pub detach_calls: usize,
    /// Payloads passed to read, in order
    pub reads: Vec<Vec<u8>>,
    /// Number of flush calls
    pub flush_calls: usize,
    /// Buffers handed back through [`BufferReturn`]
    pub returned_buffers: usize,
    /// Whether a device is attached right now
    pub attached_now: bool,
    /// Attaches made while another device was still attached
    pub overlapping_attaches: usize,
    /// Bridges dropped with a device still attached
    pub destroyed_while_attached: usize,

    /// Next attach fails with this error
    pub fail_next_attach: Option<AttachError>,
    /// Next read fails with this status
    pub fail_next_read: Option<BridgeReadError>,
    /// Next bridge construction fails
    pub fail_next_create: bool,
    /// Attach sleeps this long (simulated kernel claim)
    pub attach_delay: Option<Duration>,
    /// Reads echo the payload back through the writer
    pub echo_reads: bool,
    /// Writes queued until the next flush
    pub pending_writes: VecDeque<Vec<u8>>,
    /// Filter rules reported by the bridge
    pub filter_rules: Vec<FilterRule>,
}

/// Scriptable backend producing [`MockBridge`]s that share one log
#[derive(Clone, Default)]
pub struct MockBackend {
    log: Arc<Mutex<MockBridgeLog>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect or script the shared log
    pub fn log(&self) -> MutexGuard<'_, MockBridgeLog> {
        self.log.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue a buffer the next flush will hand to the writer
    pub fn queue_pending_write(&self, data: Vec<u8>) {
        self.log().pending_writes.push_back(data);
    }
}

impl UsbBackend for MockBackend {
    fn create_bridge(
        &self,
        writer: Arc<dyn ChannelWriter>,
    ) -> Result<Box<dyn DeviceBridge>, BackendError> {
        let mut log = self.log();
        if std::mem::take(&mut log.fail_next_create) {
            return Err(BackendError::OutOfMemory);
        }
        log.created += 1;

        Ok(Box::new(MockBridge {
            log: self.log.clone(),
            writer,
            pool: Arc::new(MockBufferPool {
                log: self.log.clone(),
            }),
        }))
    }
}

struct MockBufferPool {
    log: Arc<Mutex<MockBridgeLog>>,
}

impl BufferReturn for MockBufferPool {
    fn return_buffer(&self, _data: Vec<u8>) {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .returned_buffers += 1;
    }
}

/// Bridge created by [`MockBackend`]
pub struct MockBridge {
    log: Arc<Mutex<MockBridgeLog>>,
    writer: Arc<dyn ChannelWriter>,
    pool: Arc<MockBufferPool>,
}

impl MockBridge {
    fn log(&self) -> MutexGuard<'_, MockBridgeLog> {
        self.log.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lend(&self, data: Vec<u8>) -> WriteBuffer {
        WriteBuffer::lent(data, self.pool.clone())
    }
}

impl DeviceBridge for MockBridge {
    fn attach(&mut self, device: &UsbDevice) -> Result<(), AttachError> {
        let delay = self.log().attach_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut log = self.log();
        if let Some(err) = log.fail_next_attach.take() {
            return Err(err);
        }
        if log.attached_now {
            log.overlapping_attaches += 1;
        }
        log.attached.push((device.bus(), device.address()));
        log.attached_now = true;
        Ok(())
    }

    fn detach(&mut self) {
        let mut log = self.log();
        log.detach_calls += 1;
        log.attached_now = false;
    }

    fn read(&mut self, data: &[u8]) -> Result<(), BridgeReadError> {
        let echo = {
            let mut log = self.log();
            log.reads.push(data.to_vec());
            if let Some(err) = log.fail_next_read.take() {
                return Err(err);
            }
            log.echo_reads
        };

        // The log lock must be released before writing: returned buffers take it
        if echo {
            self.writer.write(self.lend(data.to_vec()));
        }
        Ok(())
    }

    fn flush_pending_writes(&mut self) {
        let pending: Vec<Vec<u8>> = {
            let mut log = self.log();
            log.flush_calls += 1;
            log.pending_writes.drain(..).collect()
        };
        for data in pending {
            self.writer.write(self.lend(data));
        }
    }

    fn filter_rules(&self) -> Vec<FilterRule> {
        self.log().filter_rules.clone()
    }
}

impl Drop for MockBridge {
    fn drop(&mut self) {
        let mut log = self.log();
        log.destroyed += 1;
        if std::mem::take(&mut log.attached_now) {
            log.destroyed_while_attached += 1;
        }
    }
}

// ============================================================================
// Mock permission gate
// ============================================================================

/// A request the mock gate has not answered yet
pub struct PendingPermission {
    pub bus: u16,
    pub address: u16,
    pub responder: PermissionResponder,
}

/// Permission gate whose answers are driven by the test
#[derive(Clone, Default)]
pub struct MockPermissionGate {
    pending: Arc<Mutex<Vec<PendingPermission>>>,
    requests: Arc<Mutex<usize>>,
}

impl MockPermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of requests received
    pub fn request_count(&self) -> usize {
        *self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of unanswered requests
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Take the oldest unanswered request
    pub fn take_pending(&self) -> Option<PendingPermission> {
        let mut pending = self.pending();
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        }
    }

    /// Grant the oldest unanswered request
    pub fn grant_next(&self) -> bool {
        self.take_pending().map(|p| p.responder.grant()).is_some()
    }

    /// Deny the oldest unanswered request
    pub fn deny_next(&self, reason: &str) -> bool {
        self.take_pending().map(|p| p.responder.deny(reason)).is_some()
    }

    /// Wait until at least `count` requests are pending
    pub async fn wait_for_pending(&self, count: usize) {
        while self.pending_count() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<PendingPermission>> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PermissionGate for MockPermissionGate {
    fn request(&self, bus: u16, address: u16) -> PermissionRequest {
        let (request, responder) = permission_request();
        *self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner) += 1;
        self.pending().push(PendingPermission {
            bus,
            address,
            responder,
        });
        request
    }
}
