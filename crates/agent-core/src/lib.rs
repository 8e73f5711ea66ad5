//! Instrument agent core - driver locking, service discovery and sniffer relay.
//!
//! This crate has no HTTP server of its own; `agent-rpc` exposes it over the
//! web and runs the sniffer gateway.
//!
//! # Example
//!
//! ```rust,ignore
//! use instrument_agent::{ConsulClient, LockManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> instrument_agent::Result<()> {
//!     let consul = Arc::new(ConsulClient::new("http://127.0.0.1:8500")?);
//!     let locks = LockManager::new(consul);
//!
//!     let holder = locks.set("CE01ISSM-MFD35-02-PRESFA000", "alice").await?;
//!     println!("locked by {}", holder);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consul;
pub mod driver;
pub mod error;
pub mod kv;
pub mod lock;
pub mod registry;
pub mod sniffer;

pub use config::{SessionLockOptions, SnifferOptions};
pub use consul::ConsulClient;
pub use driver::{
    CommandEnvelope, DriverClient, DriverCommand, DriverEndpoint, DriverTransport, ZmqTransport,
};
pub use error::{AgentError, Result};
pub use kv::{KvEntry, KvStore, MemoryKvStore, SessionId};
pub use lock::{CasLockMap, LockManager, SessionLock, SessionLockGuard};
pub use registry::{PortAgentInfo, ServiceInstance, ServiceRegistry, StaticRegistry};
pub use sniffer::{GatewayHandle, SniffBroker, SniffKey, SniffSession, SnifferGateway};
