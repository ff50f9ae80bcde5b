//! usbredir loopback demo
//!
//! Runs one redirection channel against an echoing backend over an in-memory
//! duplex stream, with a fake VM peer on the other end.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{BUS_NUMBER_FOR_EMULATED_USB, DeviceIdentity, UsbDevice, WorkerPool, setup_logging};
use protocol::{Capabilities, Capability, Lz4Codec, Message, VmcMessage, read_framed_async, write_framed_async};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{error, info, warn};
use usbredir::loopback::{AutoGrantGate, LoopbackBackend};
use usbredir::{
    ChannelLifecycle, ChannelOptions, FramedTransport, RecordingRegistry, RedirConfig,
    UsbredirChannel, create_session, pump_inbound,
};

#[derive(Parser, Debug)]
#[command(name = "usbredir-loopback")]
#[command(
    author,
    version,
    about = "USB redirection channel loopback demo"
)]
#[command(long_about = "
Drives a USB redirection channel end to end without real hardware.

A fake VM peer sends payloads to the channel over an in-memory stream; the
loopback backend echoes them, and the channel sends them back (compressed
when large enough and the peer supports it).

EXAMPLES:
    # Ten 4 KiB payloads through a device that goes through the permission gate
    usbredir-loopback --messages 10 --payload-size 4096

    # Emulated device (no permission check), debug logging
    usbredir-loopback --emulated --log-level debug

CONFIGURATION:
    The demo looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbredir/config.toml
    3. /etc/usbredir/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Size of each payload sent by the peer
    #[arg(long, value_name = "BYTES", default_value_t = 4096)]
    payload_size: usize,

    /// Number of payloads the peer sends
    #[arg(long, value_name = "COUNT", default_value_t = 8)]
    messages: u32,

    /// Redirect an emulated device (skips the permission gate)
    #[arg(long)]
    emulated: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = RedirConfig::default();
        let path = RedirConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        RedirConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        RedirConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbredir loopback v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    run(config, &args).await
}

async fn run(config: RedirConfig, args: &Args) -> Result<()> {
    let registry = RecordingRegistry::new();
    let (session, session_context) = create_session(registry.clone());
    let session_task = tokio::spawn(session_context.run());

    let (client_io, peer_io) = tokio::io::duplex(256 * 1024);
    let (mut client_rd, client_wr) = tokio::io::split(client_io);
    let (peer_rd, mut peer_wr) = tokio::io::split(peer_io);

    let (transport, writer_task) = FramedTransport::spawn(client_wr, false);
    let transport = Arc::new(transport);

    let pool = Arc::new(
        WorkerPool::new("usbredir-worker", config.channel.worker_threads)
            .context("Failed to start worker pool")?,
    );
    let options = ChannelOptions::from_settings(&config.channel)
        .with_gate(Arc::new(AutoGrantGate::new(Duration::from_millis(50))));

    let channel = UsbredirChannel::new(options, pool, session.clone(), transport.clone());
    let backend = LoopbackBackend::new(config.usb.filter_rules()?);
    let stats = backend.stats();
    channel
        .set_context(Arc::new(backend))
        .context("Failed to bind loopback backend")?;

    if config.channel.compression {
        channel.set_peer_capabilities(Capabilities::empty().with(Capability::DataCompressLz4));
    }
    channel.on_ready();
    info!("Guest filter: {} rule(s)", channel.guest_filter()?.len());

    let peer_task = tokio::spawn(run_peer_reader(peer_rd));
    let pump_task = tokio::spawn({
        let channel = channel.clone();
        async move { pump_inbound(&mut client_rd, &channel).await }
    });

    let device = demo_device(args.emulated);
    info!("Connecting {}", device);
    channel
        .connect_device(device)
        .await
        .map_err(|e| anyhow!("Connect failed: {}", e))?;

    let payload: Vec<u8> = (0..args.payload_size).map(|i| (i / 64) as u8).collect();
    for _ in 0..args.messages {
        let message = Message::new(VmcMessage::Data {
            data: payload.clone(),
        });
        write_framed_async(&mut peer_wr, &message)
            .await
            .context("Peer failed to send")?;
    }
    peer_wr.shutdown().await.context("Peer failed to close")?;

    let processed = pump_task.await??;
    info!("Channel processed {} inbound message(s)", processed);

    channel.clone().on_reset(false).await;
    info!(
        "Channel reset complete (state: {}, resets: {})",
        channel.state(),
        channel.reset_count()
    );

    // Closing the transport lets the writer and the peer reader finish
    transport.close();
    drop(channel);
    drop(session);

    let frames = writer_task.await??;
    let summary = peer_task.await??;
    if let Err(e) = tokio::time::timeout(Duration::from_secs(1), session_task).await {
        warn!("Session context did not stop: {}", e);
    }

    for (device, err) in registry.errors() {
        error!("Device error on {}: {}", device, err);
    }

    println!("Frames written by channel: {}", frames);
    println!(
        "Peer received {} message(s), {} compressed, {} -> {} bytes",
        summary.messages, summary.compressed, summary.wire_bytes, summary.payload_bytes
    );
    println!(
        "Loopback: {} read(s), {} byte(s) echoed, {} buffer(s) returned, {} bridge(s) created",
        stats.reads.load(std::sync::atomic::Ordering::Relaxed),
        stats.bytes_echoed.load(std::sync::atomic::Ordering::Relaxed),
        stats.buffers_returned.load(std::sync::atomic::Ordering::Relaxed),
        stats.bridges.load(std::sync::atomic::Ordering::Relaxed),
    );

    Ok(())
}

fn demo_device(emulated: bool) -> UsbDevice {
    let (bus, product) = if emulated {
        (BUS_NUMBER_FOR_EMULATED_USB, "Emulated CD-ROM")
    } else {
        (1, "Loopback Flash Drive")
    };

    UsbDevice::new(DeviceIdentity {
        bus,
        address: 4,
        vendor_id: 0x0781,
        product_id: 0x5581,
        isochronous: false,
        manufacturer: Some("usbredir".to_string()),
        product: Some(product.to_string()),
    })
}

#[derive(Debug, Default)]
struct PeerSummary {
    messages: u64,
    compressed: u64,
    wire_bytes: u64,
    payload_bytes: u64,
}

/// The fake VM peer: read everything the channel sends and verify it
async fn run_peer_reader<R>(mut reader: R) -> Result<PeerSummary>
where
    R: AsyncRead + Unpin,
{
    let mut summary = PeerSummary::default();

    while let Some(message) = read_framed_async(&mut reader).await? {
        summary.messages += 1;
        summary.wire_bytes += message.payload.wire_len() as u64;

        let payload = match message.payload {
            VmcMessage::Data { data } => data,
            VmcMessage::CompressedData(envelope) => {
                summary.compressed += 1;
                envelope
                    .decompress(Some(&Lz4Codec))
                    .context("Peer received a corrupt envelope")?
            }
        };
        summary.payload_bytes += payload.len() as u64;
    }

    Ok(summary)
}
