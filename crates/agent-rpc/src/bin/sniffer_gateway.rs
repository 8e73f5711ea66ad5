//! Sniffer gateway.
//!
//! Serves buffered sniffer port output to local clients over a Unix socket.

use agent_rpc::setup::{consul_url, init_logging};
use anyhow::Result;
use clap::Parser;
use instrument_agent::config::{sniffer_socket_path, RegistryConfig, SnifferConfig, SnifferOptions};
use instrument_agent::{ConsulClient, SniffBroker, SnifferGateway};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sniffer-gateway")]
#[command(about = "Relay instrument sniffer ports over a Unix socket")]
struct Args {
    /// Socket path to listen on (default: $SNIFF_UNIX_SOCKFILE or /tmp/sniff.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Consul agent address
    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = RegistryConfig::DEFAULT_CONSUL_URL)]
    consul_url: String,

    /// Chunks buffered per session before the oldest is dropped
    #[arg(long, default_value_t = SnifferConfig::BUFFER_CAPACITY)]
    buffer_capacity: usize,

    /// Seconds without a read before a session is closed
    #[arg(long, default_value_t = SnifferConfig::IDLE_WINDOW.as_secs())]
    idle_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let url = consul_url(&args.consul_url);
    info!("Starting sniffer gateway (Consul at {})", url);

    let registry = Arc::new(ConsulClient::new(&url)?);
    let options = SnifferOptions {
        buffer_capacity: args.buffer_capacity,
        idle_window: Duration::from_secs(args.idle_secs),
        ..SnifferOptions::default()
    };
    let broker = SniffBroker::new(registry, options);
    let socket = args.socket.unwrap_or_else(sniffer_socket_path);
    let mut handle = SnifferGateway::start(&socket, broker.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    handle.shutdown();
    broker.shutdown().await;
    handle.join().await;

    Ok(())
}
