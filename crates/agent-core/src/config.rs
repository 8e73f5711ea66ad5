//! Centralized configuration for the instrument agent.
//!
//! Fixed constants live on unit structs; tunables that tests and binaries
//! override are plain option structs with `Default` impls.

use std::path::PathBuf;
use std::time::Duration;

/// Lock layout and session lock tuning.
pub struct LockConfig;

impl LockConfig {
    pub const KEY_PREFIX: &'static str = "lock/";
    pub const MASTER_NAME: &'static str = "master";
    pub const SESSION_TTL: Duration = Duration::from_secs(10);
    pub const NUM_RETRIES: u32 = 3;
    pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);
    pub const SESSION_NAME: &'static str = "instrument-agent-master";
}

/// Service registry naming.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const DEFAULT_CONSUL_URL: &'static str = "http://127.0.0.1:8500";
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DRIVER_SERVICE: &'static str = "instrument_driver";
    pub const SNIFF_SERVICE: &'static str = "sniff-port-agent";
    /// Port agent summary: (response field, service name)
    pub const PORT_AGENT_SERVICES: [(&'static str, &'static str); 4] = [
        ("data", "port-agent"),
        ("command", "command-port-agent"),
        ("sniff", "sniff-port-agent"),
        ("da", "da-port-agent"),
    ];
}

/// Sniffer broker defaults.
pub struct SnifferConfig;

impl SnifferConfig {
    pub const SOCKET_ENV_KEY: &'static str = "SNIFF_UNIX_SOCKFILE";
    pub const DEFAULT_SOCKET_PATH: &'static str = "/tmp/sniff.sock";
    pub const BUFFER_CAPACITY: usize = 1000;
    pub const IDLE_WINDOW: Duration = Duration::from_secs(60);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const READ_CHUNK_SIZE: usize = 4096;
}

/// Local request gateway limits.
pub struct GatewayConfig;

impl GatewayConfig {
    pub const MAX_REQUEST_SIZE: usize = 64 * 1024;
    pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 256;
    pub const FAILURE_MARKER: &'static [u8] = b"SNIFFER_UNAVAILABLE";
}

/// Driver RPC defaults.
pub struct DriverConfig;

impl DriverConfig {
    /// Timeout for plain commands when the caller gives none.
    pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);
    /// Fallback per-command timeout when driver metadata has none.
    pub const METADATA_TIMEOUT_SECS: u64 = 60;
    /// Timeout the web layer uses when the request carries none.
    pub const REQUEST_TIMEOUT_MS: u64 = 90_000;
}

/// Resolve the sniffer gateway socket path from the environment.
pub fn sniffer_socket_path() -> PathBuf {
    std::env::var_os(SnifferConfig::SOCKET_ENV_KEY)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SnifferConfig::DEFAULT_SOCKET_PATH))
}

/// Session lock tunables.
#[derive(Debug, Clone)]
pub struct SessionLockOptions {
    /// Server side TTL of each session.
    pub ttl: Duration,
    /// Total acquisition attempts before giving up.
    pub num_retries: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
    /// Session name recorded in the store.
    pub session_name: String,
}

impl Default for SessionLockOptions {
    fn default() -> Self {
        Self {
            ttl: LockConfig::SESSION_TTL,
            num_retries: LockConfig::NUM_RETRIES,
            backoff: LockConfig::RETRY_BACKOFF,
            session_name: LockConfig::SESSION_NAME.to_string(),
        }
    }
}

/// Sniffer broker tunables.
#[derive(Debug, Clone)]
pub struct SnifferOptions {
    pub buffer_capacity: usize,
    pub idle_window: Duration,
    pub connect_timeout: Duration,
    pub service_name: String,
}

impl SnifferOptions {
    /// Interval at which idle sessions are checked.
    pub fn idle_check_interval(&self) -> Duration {
        (self.idle_window / 4).max(Duration::from_millis(10))
    }
}

impl Default for SnifferOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: SnifferConfig::BUFFER_CAPACITY,
            idle_window: SnifferConfig::IDLE_WINDOW,
            connect_timeout: SnifferConfig::CONNECT_TIMEOUT,
            service_name: RegistryConfig::SNIFF_SERVICE.to_string(),
        }
    }
}
