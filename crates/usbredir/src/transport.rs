//! Framed byte-stream transport
//!
//! Outbound messages are queued to a writer task that encodes them as
//! length-prefixed frames. Each message is dropped only after its frame has
//! been written, which is what hands raw buffers back to the bridge.

use crate::channel::UsbredirChannel;
use crate::error::{ChannelError, TransportError};
use crate::outbound::{OutboundMessage, Transport};
use async_channel::{Receiver, Sender, unbounded};
use protocol::{ProtocolError, read_framed_async, validate_version, write_framed_async};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Transport writing frames to any `AsyncWrite`
pub struct FramedTransport {
    tx: Sender<OutboundMessage>,
    local: bool,
}

impl FramedTransport {
    /// Spawn the writer task on the current runtime
    ///
    /// `local` marks a trusted local pipe. The task finishes with the number
    /// of frames written once the transport is closed or dropped.
    pub fn spawn<W>(writer: W, local: bool) -> (Self, JoinHandle<Result<u64, ProtocolError>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let handle = tokio::spawn(writer_loop(rx, writer));
        (Self { tx, local }, handle)
    }

    /// Stop accepting messages; queued ones are still written
    pub fn close(&self) {
        self.tx.close();
    }

    /// Messages waiting for the writer task
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

impl Transport for FramedTransport {
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.tx
            .try_send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn is_local(&self) -> bool {
        self.local
    }
}

async fn writer_loop<W>(rx: Receiver<OutboundMessage>, mut writer: W) -> Result<u64, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut frames = 0u64;

    while let Ok(message) = rx.recv().await {
        write_framed_async(&mut writer, &message.to_message()).await?;
        drop(message);
        frames += 1;
    }

    writer.shutdown().await?;
    debug!("Transport writer finished after {} frames", frames);
    Ok(frames)
}

/// Feed frames from `reader` into the channel until end of stream
///
/// Malformed payloads are dropped and processing continues; transport and
/// framing errors end the pump. Returns the number of messages processed.
pub async fn pump_inbound<R>(reader: &mut R, channel: &UsbredirChannel) -> Result<u64, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut processed = 0u64;

    while let Some(message) = read_framed_async(reader).await.map_err(TransportError::from)? {
        validate_version(&message.version).map_err(TransportError::from)?;

        match channel.handle_message(message.payload).await {
            Ok(()) => processed += 1,
            Err(ChannelError::ParseError(e)) => {
                debug!("Skipped inbound message: {}", e);
            }
            Err(e) => {
                warn!("Inbound pump stopping: {}", e);
                return Err(e);
            }
        }
    }

    debug!("Inbound stream closed after {} messages", processed);
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::WriteBuffer;
    use protocol::VmcMessage;

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (client, mut peer) = tokio::io::duplex(64 * 1024);
        let (transport, writer) = FramedTransport::spawn(client, false);

        transport
            .send(OutboundMessage::Data(WriteBuffer::owned(vec![1])))
            .unwrap();
        transport
            .send(OutboundMessage::Data(WriteBuffer::owned(vec![2, 2])))
            .unwrap();
        transport.close();

        assert_eq!(writer.await.unwrap().unwrap(), 2);

        let first = read_framed_async(&mut peer).await.unwrap().unwrap();
        let second = read_framed_async(&mut peer).await.unwrap().unwrap();
        assert_eq!(first.payload, VmcMessage::Data { data: vec![1] });
        assert_eq!(second.payload, VmcMessage::Data { data: vec![2, 2] });
        assert!(read_framed_async(&mut peer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client, _peer) = tokio::io::duplex(1024);
        let (transport, _writer) = FramedTransport::spawn(client, true);

        assert!(transport.is_local());
        transport.close();
        assert!(matches!(
            transport.send(OutboundMessage::Data(WriteBuffer::owned(vec![0]))),
            Err(TransportError::Closed)
        ));
    }
}
