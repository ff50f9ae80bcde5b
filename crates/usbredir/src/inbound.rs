//! Inbound message path
//!
//! Messages from the peer are fed to the device bridge under the channel
//! lock. A failing read with a device attached disconnects it and reports the
//! error to the session, and the message path waits for the session to
//! acknowledge before processing anything else.

use crate::channel::UsbredirChannel;
use crate::error::ChannelError;
use protocol::VmcMessage;
use tracing::{debug, trace, warn};

impl UsbredirChannel {
    /// Process one message received from the peer
    ///
    /// Malformed compressed payloads are dropped with `ParseError`; the
    /// channel stays usable. Bridge read failures are not returned here,
    /// they go to the session's device registry.
    pub async fn handle_message(&self, message: VmcMessage) -> Result<(), ChannelError> {
        let data = match message {
            VmcMessage::Data { data } => data,
            VmcMessage::CompressedData(envelope) => {
                let data = envelope.decompress(self.codec.as_deref()).map_err(|e| {
                    warn!("Dropping malformed compressed payload: {}", e);
                    ChannelError::ParseError(e)
                })?;
                trace!(
                    "Decompressed {} bytes to {} bytes",
                    envelope.compressed_size(),
                    data.len()
                );
                data
            }
        };

        let failure = {
            let mut inner = self.lock();
            let bridge = inner.bridge.as_mut().ok_or(ChannelError::NoBackend)?;

            match bridge.read(&data) {
                Ok(()) => None,
                Err(status) => match inner.device.clone() {
                    Some(device) => {
                        let error = status.describe(&device.description());
                        self.disconnect_locked(&mut inner);
                        Some((device, error))
                    }
                    None => {
                        debug!("Bridge read failed with no device attached: {}", status);
                        None
                    }
                },
            }
        };

        if let Some((device, error)) = failure {
            warn!("Device error on {}: {}", device, error);
            self.session
                .report_device_error(device, error, self.error_ack_timeout)
                .await?;
        }
        Ok(())
    }
}
