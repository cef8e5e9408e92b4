//! Vita key manager daemon
//!
//! Loads configuration, builds the key manager, and drives its tick loop.
//! A UDP socket stands in for the gateway's dispatch app: received
//! datagrams are stripped of their IPv4 framing and queued for the next
//! tick, and emitted datagrams are forwarded to the peer gateway's
//! underlay port.

use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use vita_keymgr::{wire, Config, KeyManager};

/// Vita IPsec gateway key manager
#[derive(Parser, Debug)]
#[command(name = "vita-keymgr", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
}

/// How often the manager tick runs.
const TICK_INTERVAL_MS: u64 = 100;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("vita key manager starting");

    let config = match Config::load_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(
                "Failed to load configuration from {}: {}",
                args.config.display(),
                e
            );
            std::process::exit(1);
        }
    };

    let mut manager = match KeyManager::new(&config, now_ms()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to create key manager: {}", e);
            std::process::exit(1);
        }
    };

    let socket = match UdpSocket::bind(("0.0.0.0", config.underlay_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            error!(
                "Failed to bind underlay port {}: {}",
                config.underlay_port, e
            );
            std::process::exit(1);
        }
    };

    info!(
        node_ip4 = %config.node_ip4,
        routes = config.routes.len(),
        sa_database = %config.sa_database.display(),
        underlay_port = config.underlay_port,
        "vita key manager running, press Ctrl+C to exit"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
    let mut buffer = [0u8; 2048];
    let mut inbound: Vec<Vec<u8>> = Vec::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let outbound = manager.tick(now_ms(), &inbound);
                inbound.clear();
                for frame in outbound {
                    let Some(destination) = wire::ip4_destination(&frame) else {
                        continue;
                    };
                    if let Err(e) = socket
                        .send_to(&frame, (destination, config.underlay_port))
                        .await
                    {
                        warn!(%destination, "Failed to send datagram: {}", e);
                    }
                }
            }
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, from)) => match wire::decapsulate_ip4(&buffer[..len]) {
                    Ok(payload) => inbound.push(payload.to_vec()),
                    Err(e) => debug!(%from, "Dropped underlay datagram: {}", e),
                },
                Err(e) => warn!("Underlay receive error: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let counters = manager.counters();
    info!(
        keypairs_negotiated = counters.keypairs_negotiated,
        negotiations_initiated = counters.negotiations_initiated,
        rxerrors = counters.rxerrors(),
        "vita key manager shutdown complete"
    );
}
