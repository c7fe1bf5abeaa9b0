//! avp-loopback - run an AVP guest device against the in-process host
//!
//! Creates a device through the manager, pushes frames through the transmit
//! path, has the host echo them back on the receive rings and optionally
//! migrates the device in the middle. Statistics and the negotiated
//! configuration are printed as JSON at the end.

use anyhow::{bail, Context, Result};
use clap::Parser;
use libavp::loopback::{CollectingStack, LoopbackConfig, LoopbackHost};
use libavp::{AvpConfig, AvpDevice, DeviceManager, InterruptStatus, Packet};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "avp-loopback")]
#[command(about = "Exercise the AVP guest driver against a loopback host")]
struct Args {
    /// Configuration directory (a default avp.toml is written if missing)
    #[arg(long, default_value = "avp-config", env = "AVP_CONFIG_DIR")]
    config_dir: String,

    /// Frames to send in each traffic round
    #[arg(short, long, default_value_t = 64)]
    frames: usize,

    /// Migrate the device between two traffic rounds
    #[arg(short, long)]
    migrate: bool,

    /// Receive queues the host offers
    #[arg(long, default_value_t = 2)]
    rx_queues: u8,

    /// Transmit queues the host offers
    #[arg(long, default_value_t = 2)]
    tx_queues: u8,

    /// Log filter
    #[arg(long, default_value = "info", env = "AVP_LOG")]
    log: String,
}

#[derive(Serialize)]
struct Report {
    device: libavp::DeviceConfig,
    stats: libavp::Stats64,
    migrations: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::new(&args.log))
        .init();

    let config = AvpConfig::load(&args.config_dir)
        .with_context(|| format!("loading configuration from {}", args.config_dir))?;

    let host = Arc::new(LoopbackHost::new(LoopbackConfig {
        rx_queues: args.rx_queues,
        tx_queues: args.tx_queues,
        ..Default::default()
    })?);
    let stack = Arc::new(CollectingStack::new());
    let manager = Arc::new(DeviceManager::new(config, stack.clone())?);

    // Response interrupts from the host land in the manager
    let _responder = {
        let manager = Arc::downgrade(&manager);
        let id = host.device_id();
        host.spawn_responder(move || {
            if let Some(manager) = manager.upgrade() {
                if let Err(e) = manager.handle_interrupt(id, InterruptStatus::RESPONSE) {
                    warn!("Response interrupt not delivered: {}", e);
                }
            }
        })
    };

    let device = manager
        .create_device(host.resources())
        .context("creating device")?;
    device.open()?;
    info!("Device {} up", device.id());

    run_traffic(&host, &device, &stack, args.frames)?;

    if args.migrate {
        let status = host.begin_migration()?;
        manager.handle_interrupt(device.id(), status)?;
        info!("Migration started, device {:?}", device.status());

        let status = host.end_migration()?;
        manager.handle_interrupt(device.id(), status)?;
        info!("Migration finished, device {:?}", device.status());

        run_traffic(&host, &device, &stack, args.frames)?;
    }

    let report = Report {
        device: manager.query_config(device.id())?,
        stats: device.stats64(),
        migrations: host.epoch(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.shutdown();
    Ok(())
}

/// Send `frames` frames and wait for the host to echo every one back.
fn run_traffic(
    host: &LoopbackHost,
    device: &AvpDevice,
    stack: &CollectingStack,
    frames: usize,
) -> Result<()> {
    let tx_queues = device.tx_queue_count().max(1);
    let rx_queues = device.rx_queue_count().max(1);
    let mut sent = 0;
    let mut echoed = 0;

    for i in 0..frames {
        // Sizes sweep from runt frames to multi-segment jumbo frames
        let len = 1 + (i * 997) % 9000;
        let payload: Vec<u8> = (0..len).map(|b| (b + i) as u8).collect();
        let queue = (i % tx_queues as usize) as u16;
        if device.transmit(queue, Packet::from_bytes(payload)).is_queued() {
            sent += 1;
        }

        // Echo everything the host has seen so far
        for q in 0..tx_queues {
            for frame in host.drain_tx(q as u8)? {
                let rx = (i % rx_queues as usize) as u8;
                if host.inject(rx, &frame.packet)? {
                    echoed += 1;
                } else {
                    warn!("Host could not echo a frame on queue {}", rx);
                }
            }
        }
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = 0;
    while received < echoed {
        received += stack.take().len();
        if Instant::now() > deadline {
            bail!("only {received} of {echoed} echoed frames came back");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    info!(sent, echoed, received, "Traffic round complete");
    Ok(())
}
