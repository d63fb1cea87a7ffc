//! bust4-monitor - Bus T4 line monitor
//!
//! Attaches the protocol engine to a serial port, logs bus traffic, and
//! periodically prints the discovered device model as JSON.

use anyhow::{bail, Context};
use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use bust4_core::engine::{BusClient, EngineConfig};
use bust4_core::protocol::serial;
use bust4_core::protocol::BusAddress;

#[derive(Parser)]
#[command(name = "bust4-monitor")]
#[command(about = "Bus T4 line monitor and discovery watcher")]
#[command(version)]
struct Cli {
    /// Serial port the bus is attached to (e.g. /dev/ttyUSB0)
    port: Option<String>,

    /// Baud rate of the bus
    #[arg(short, long, default_value_t = 19200, env = "BUST4_BAUD")]
    baud: u32,

    /// Seconds between device model snapshots (0 disables them)
    #[arg(short, long, default_value_t = 5)]
    interval: u64,

    /// List available serial ports and exit
    #[arg(short, long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        for port in serial::list_ports() {
            match (port.manufacturer.as_deref(), port.product.as_deref()) {
                (Some(manufacturer), Some(product)) => {
                    println!("{}  {} {}", port.name, manufacturer, product)
                }
                (_, Some(product)) => println!("{}  {}", port.name, product),
                _ => println!("{}", port.name),
            }
        }
        return Ok(());
    }

    let Some(port_name) = cli.port else {
        bail!("no serial port given (use --list-ports to see candidates)");
    };

    let stream = serial::open_port(&port_name, Some(cli.baud))
        .with_context(|| format!("opening {}", port_name))?;
    tracing::info!("Listening on {} at {} baud", port_name, cli.baud);

    let client = BusClient::spawn(stream, EngineConfig::default());
    client.set_frame_observer(|frame| {
        tracing::debug!(
            from = %frame.from().unwrap_or(BusAddress::UNKNOWN),
            to = %frame.to().unwrap_or(BusAddress::UNKNOWN),
            device = frame.device(),
            command = frame.command(),
            bytes = ?frame.as_bytes(),
            "frame"
        );
    });

    // interval 0 means traffic logging only
    let snapshot_period = Duration::from_secs(cli.interval.max(1));
    let mut ticker = tokio::time::interval(snapshot_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            _ = ticker.tick(), if cli.interval > 0 => {
                match client.lock_unit(Duration::from_secs(1)).await {
                    Ok(unit) => println!("{}", serde_json::to_string_pretty(&*unit)?),
                    Err(e) => tracing::warn!("Device model busy: {}", e),
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
