//! Loopback backend for the demo binary
//!
//! The bridge attaches instantly and echoes every payload it reads back
//! through the channel writer, so traffic from the peer comes straight back
//! out of the outbound path.

use common::{
    AttachError, BackendError, BridgeReadError, BufferReturn, ChannelWriter, DeviceBridge,
    FilterRule, PermissionGate, PermissionRequest, UsbBackend, UsbDevice, WriteBuffer,
    permission_request,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Counters shared by every bridge the backend creates
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub bridges: AtomicU64,
    pub reads: AtomicU64,
    pub bytes_echoed: AtomicU64,
    pub buffers_returned: AtomicU64,
}

impl BufferReturn for LoopbackStats {
    fn return_buffer(&self, data: Vec<u8>) {
        trace!("Loopback buffer of {} bytes returned", data.len());
        self.buffers_returned.fetch_add(1, Ordering::Relaxed);
    }
}

/// Backend whose bridges echo what they read
pub struct LoopbackBackend {
    stats: Arc<LoopbackStats>,
    filter_rules: Vec<FilterRule>,
}

impl LoopbackBackend {
    pub fn new(filter_rules: Vec<FilterRule>) -> Self {
        Self {
            stats: Arc::new(LoopbackStats::default()),
            filter_rules,
        }
    }

    pub fn stats(&self) -> Arc<LoopbackStats> {
        self.stats.clone()
    }
}

impl UsbBackend for LoopbackBackend {
    fn create_bridge(
        &self,
        writer: Arc<dyn ChannelWriter>,
    ) -> Result<Box<dyn DeviceBridge>, BackendError> {
        self.stats.bridges.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(LoopbackBridge {
            writer,
            stats: self.stats.clone(),
            filter_rules: self.filter_rules.clone(),
            device: None,
        }))
    }
}

struct LoopbackBridge {
    writer: Arc<dyn ChannelWriter>,
    stats: Arc<LoopbackStats>,
    filter_rules: Vec<FilterRule>,
    device: Option<UsbDevice>,
}

impl DeviceBridge for LoopbackBridge {
    fn attach(&mut self, device: &UsbDevice) -> Result<(), AttachError> {
        if self.device.is_some() {
            return Err(AttachError::Failed("loopback already attached".to_string()));
        }
        debug!("Loopback attached {}", device);
        self.device = Some(device.clone());
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(device) = self.device.take() {
            debug!("Loopback detached {}", device);
        }
    }

    fn read(&mut self, data: &[u8]) -> Result<(), BridgeReadError> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        if self.device.is_none() {
            return Ok(());
        }

        let written = self
            .writer
            .write(WriteBuffer::lent(data.to_vec(), self.stats.clone()));
        self.stats
            .bytes_echoed
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    fn flush_pending_writes(&mut self) {}

    fn filter_rules(&self) -> Vec<FilterRule> {
        self.filter_rules.clone()
    }
}

/// Permission gate that grants every request after a delay
pub struct AutoGrantGate {
    delay: Duration,
}

impl AutoGrantGate {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl PermissionGate for AutoGrantGate {
    fn request(&self, bus: u16, address: u16) -> PermissionRequest {
        let (request, mut responder) = permission_request();
        let delay = self.delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if responder.is_cancelled() {
                debug!("Permission request for {}-{} cancelled", bus, address);
                responder.respond(Err(common::PermissionError::Cancelled));
            } else {
                debug!("Granting access to {}-{}", bus, address);
                responder.grant();
            }
        });

        request
    }
}
