//! Instrument agent web server.
//!
//! Serves the driver command and lock API backed by Consul, or by in-process
//! stores with `--memory-store`.

use agent_rpc::server::{self, AppState};
use agent_rpc::setup::{consul_url, init_logging};
use anyhow::Result;
use clap::Parser;
use instrument_agent::config::RegistryConfig;
use instrument_agent::{
    ConsulClient, KvStore, LockManager, MemoryKvStore, ServiceRegistry, StaticRegistry,
    ZmqTransport,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "agent-rpc")]
#[command(about = "Instrument agent web API")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "12572")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Consul agent address
    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = RegistryConfig::DEFAULT_CONSUL_URL)]
    consul_url: String,

    /// Keep locks in memory and start with an empty registry (no Consul)
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    info!("Starting instrument agent web server");

    let (store, registry): (Arc<dyn KvStore>, Arc<dyn ServiceRegistry>) = if args.memory_store {
        warn!("Using in-memory lock store and an empty registry");
        (
            Arc::new(MemoryKvStore::new()),
            Arc::new(StaticRegistry::new()),
        )
    } else {
        let url = consul_url(&args.consul_url);
        info!("Consul at {}", url);
        let consul = Arc::new(ConsulClient::new(&url)?);
        (consul.clone(), consul)
    };

    let state = AppState::new(
        registry,
        LockManager::new(store),
        Arc::new(ZmqTransport::new()),
    );
    let addr = server::start_server(state, &args.host, args.port).await?;

    // Bound port on stdout for supervisors that start us with --port 0
    println!("RPC_PORT={}", addr.port());

    info!("Web server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
