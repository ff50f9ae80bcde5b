//! Message Path Integration Tests
//!
//! Drives a channel over a real framed transport with a fake peer on the
//! other end of an in-memory duplex stream.
//!
//! # Test Scenarios
//! - Outbound compression policy (threshold, local pipe, isochronous, peer caps)
//! - Inbound decompression and malformed envelopes
//! - Device error hand-off to the session registry
//! - Write buffer return after transmission
//!
//! Run with: `cargo test -p usbredir --test message_path_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockBackend, create_emulated_device, create_isochronous_device,
    create_mock_bulk_data, with_timeout,
};
use common::{BridgeReadError, DeviceErrorKind, UsbDevice, WorkerPool};
use protocol::{
    BlockCodec, Capabilities, Capability, CompressedData, CompressionType, Lz4Codec, Message,
    ProtocolError, VmcMessage, read_framed_async, write_framed_async,
};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use usbredir::{
    COMPRESS_THRESHOLD, ChannelError, ChannelOptions, ChannelState, FramedTransport,
    RecordingRegistry, UsbredirChannel, create_session, pump_inbound,
};

struct Harness {
    channel: Arc<UsbredirChannel>,
    backend: MockBackend,
    registry: RecordingRegistry,
    transport: Arc<FramedTransport>,
    peer_rd: ReadHalf<DuplexStream>,
    peer_wr: WriteHalf<DuplexStream>,
    pump: JoinHandle<Result<u64, ChannelError>>,
    writer: JoinHandle<Result<u64, ProtocolError>>,
}

#[derive(Clone, Copy)]
struct Setup {
    local: bool,
    codec: bool,
    peer_lz4: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            local: false,
            codec: true,
            peer_lz4: true,
        }
    }
}

async fn harness(setup: Setup, device: UsbDevice) -> Harness {
    let registry = RecordingRegistry::new();
    let (session, context) = create_session(registry.clone());
    tokio::spawn(context.run());

    let (client_io, peer_io) = tokio::io::duplex(1024 * 1024);
    let (mut client_rd, client_wr) = tokio::io::split(client_io);
    let (peer_rd, peer_wr) = tokio::io::split(peer_io);

    let (transport, writer) = FramedTransport::spawn(client_wr, setup.local);
    let transport = Arc::new(transport);

    let mut options = ChannelOptions::default();
    if setup.codec {
        options.codec = Some(Arc::new(Lz4Codec));
    }
    let pool = Arc::new(WorkerPool::new("message-test", 2).unwrap());
    let channel = UsbredirChannel::new(options, pool, session, transport.clone());

    let backend = MockBackend::new();
    backend.log().echo_reads = true;
    channel.set_context(Arc::new(backend.clone())).unwrap();
    if setup.peer_lz4 {
        channel.set_peer_capabilities(Capabilities::empty().with(Capability::DataCompressLz4));
    }
    channel.connect_device(device).await.unwrap();

    let pump = tokio::spawn({
        let channel = channel.clone();
        async move { pump_inbound(&mut client_rd, &channel).await }
    });

    Harness {
        channel,
        backend,
        registry,
        transport,
        peer_rd,
        peer_wr,
        pump,
        writer,
    }
}

impl Harness {
    async fn send(&mut self, payload: VmcMessage) {
        write_framed_async(&mut self.peer_wr, &Message::new(payload))
            .await
            .unwrap();
    }

    async fn send_data(&mut self, data: Vec<u8>) {
        self.send(VmcMessage::Data { data }).await;
    }

    async fn recv(&mut self) -> VmcMessage {
        with_timeout(DEFAULT_TEST_TIMEOUT, read_framed_async(&mut self.peer_rd))
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .payload
    }

    /// Close the peer's send side and wait for the pump to drain
    async fn finish_inbound(&mut self) -> u64 {
        self.peer_wr.shutdown().await.unwrap();
        with_timeout(DEFAULT_TEST_TIMEOUT, &mut self.pump)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }
}

fn restore(message: VmcMessage) -> (bool, Vec<u8>) {
    match message {
        VmcMessage::Data { data } => (false, data),
        VmcMessage::CompressedData(envelope) => {
            (true, envelope.decompress(Some(&Lz4Codec)).unwrap())
        }
    }
}

// ============================================================================
// Outbound Compression Policy
// ============================================================================

#[tokio::test]
async fn test_large_payload_is_compressed_and_restorable() {
    let mut h = harness(Setup::default(), create_emulated_device(1)).await;
    let payload = create_mock_bulk_data(16 * 1024);

    h.send_data(payload.clone()).await;
    let (compressed, restored) = restore(h.recv().await);

    assert!(compressed);
    assert_eq!(restored, payload);
}

#[tokio::test]
async fn test_threshold_boundary() {
    let mut h = harness(Setup::default(), create_emulated_device(1)).await;

    h.send_data(vec![0; COMPRESS_THRESHOLD]).await;
    h.send_data(vec![0; COMPRESS_THRESHOLD + 1]).await;

    let (at_threshold, _) = restore(h.recv().await);
    let (above, restored) = restore(h.recv().await);
    assert!(!at_threshold);
    assert!(above);
    assert_eq!(restored.len(), COMPRESS_THRESHOLD + 1);
}

#[tokio::test]
async fn test_local_transport_never_compresses() {
    let setup = Setup {
        local: true,
        ..Setup::default()
    };
    let mut h = harness(setup, create_emulated_device(1)).await;

    h.send_data(vec![0; 64 * 1024]).await;
    assert!(matches!(h.recv().await, VmcMessage::Data { .. }));
}

#[tokio::test]
async fn test_isochronous_device_never_compresses() {
    let mut h = harness(Setup::default(), create_isochronous_device(1, 9)).await;

    h.send_data(vec![0; 64 * 1024]).await;
    assert!(matches!(h.recv().await, VmcMessage::Data { .. }));
}

#[tokio::test]
async fn test_peer_without_capability_gets_raw() {
    let setup = Setup {
        peer_lz4: false,
        ..Setup::default()
    };
    let mut h = harness(setup, create_emulated_device(1)).await;

    h.send_data(vec![0; 64 * 1024]).await;
    assert!(matches!(h.recv().await, VmcMessage::Data { .. }));
}

#[tokio::test]
async fn test_reset_forgets_peer_capability() {
    let mut h = harness(Setup::default(), create_emulated_device(1)).await;
    usbredir::ChannelLifecycle::on_reset(h.channel.clone(), false).await;
    h.channel.connect_device(create_emulated_device(2)).await.unwrap();

    h.send_data(vec![0; 64 * 1024]).await;
    assert!(matches!(h.recv().await, VmcMessage::Data { .. }));
}

// ============================================================================
// Inbound Path
// ============================================================================

#[tokio::test]
async fn test_compressed_inbound_reaches_bridge_expanded() {
    let mut h = harness(Setup::default(), create_emulated_device(1)).await;
    let payload = create_mock_bulk_data(4096);
    let compressed = Lz4Codec.compress(&payload).unwrap();

    h.send(VmcMessage::CompressedData(CompressedData::new(
        CompressionType::Lz4,
        4096,
        compressed,
    )))
    .await;

    assert_eq!(h.finish_inbound().await, 1);
    assert_eq!(h.backend.log().reads, vec![payload]);
}

#[tokio::test]
async fn test_malformed_envelopes_are_dropped() {
    let mut h = harness(Setup::default(), create_emulated_device(1)).await;
    let payload = create_mock_bulk_data(4096);
    let compressed = Lz4Codec.compress(&payload).unwrap();

    // Declared size zero
    h.send(VmcMessage::CompressedData(CompressedData::new(
        CompressionType::Lz4,
        0,
        compressed.clone(),
    )))
    .await;
    // Declared size does not match
    h.send(VmcMessage::CompressedData(CompressedData::new(
        CompressionType::Lz4,
        4000,
        compressed,
    )))
    .await;
    // Unknown algorithm
    h.send(VmcMessage::CompressedData(CompressedData {
        compression: 200,
        uncompressed_size: 3,
        data: vec![1, 2, 3],
    }))
    .await;
    h.send_data(vec![7; 16]).await;

    assert_eq!(h.finish_inbound().await, 1);
    assert_eq!(h.backend.log().reads, vec![vec![7; 16]]);
    assert_eq!(h.channel.state(), ChannelState::Connected);
    assert!(h.registry.errors().is_empty());
}

#[tokio::test]
async fn test_compressed_inbound_without_codec_is_dropped() {
    let setup = Setup {
        codec: false,
        ..Setup::default()
    };
    let mut h = harness(setup, create_emulated_device(1)).await;
    let payload = create_mock_bulk_data(4096);
    let compressed = Lz4Codec.compress(&payload).unwrap();

    h.send(VmcMessage::CompressedData(CompressedData::new(
        CompressionType::Lz4,
        4096,
        compressed,
    )))
    .await;

    assert_eq!(h.finish_inbound().await, 0);
    assert!(h.backend.log().reads.is_empty());
}

// ============================================================================
// Device Error Hand-off
// ============================================================================

#[tokio::test]
async fn test_read_error_notifies_registry_once() {
    let device = create_emulated_device(3);
    let mut h = harness(Setup::default(), device.clone()).await;
    h.backend.log().fail_next_read = Some(BridgeReadError::DeviceRejected);
    h.backend.log().echo_reads = false;

    h.send_data(vec![1]).await;
    h.send_data(vec![2]).await;
    h.finish_inbound().await;

    assert_eq!(h.channel.state(), ChannelState::Disconnected);
    assert!(h.channel.device().is_none());

    let errors = h.registry.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.same_device(&device));
    assert_eq!(errors[0].1.kind, DeviceErrorKind::Rejected);
    assert!(errors[0].1.message.contains("rejected by host"));
}

#[tokio::test]
async fn test_second_read_error_without_device_is_not_reported() {
    let mut h = harness(Setup::default(), create_emulated_device(3)).await;
    h.backend.log().echo_reads = false;

    h.backend.log().fail_next_read = Some(BridgeReadError::DeviceLost);
    h.send_data(vec![1]).await;
    h.finish_inbound().await;

    // Device is gone; a further failing read has no one to blame
    h.backend.log().fail_next_read = Some(BridgeReadError::Io);
    h.channel
        .handle_message(VmcMessage::Data { data: vec![2] })
        .await
        .unwrap();

    assert_eq!(h.registry.errors().len(), 1);
}

// ============================================================================
// Buffer Ownership
// ============================================================================

#[tokio::test]
async fn test_raw_buffers_returned_after_write() {
    let setup = Setup {
        local: true,
        ..Setup::default()
    };
    let mut h = harness(setup, create_emulated_device(1)).await;

    for i in 0..5u8 {
        h.send_data(vec![i; 128]).await;
    }
    for _ in 0..5 {
        h.recv().await;
    }
    assert_eq!(h.finish_inbound().await, 5);

    h.transport.close();
    let frames = with_timeout(DEFAULT_TEST_TIMEOUT, &mut h.writer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(frames, 5);
    assert_eq!(h.backend.log().returned_buffers, 5);
}
