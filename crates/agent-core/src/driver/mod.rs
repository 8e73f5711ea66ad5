//! RPC access to instrument driver processes.
//!
//! Drivers answer a JSON envelope `{"cmd": .., "args": [..], "kwargs": {..}}`
//! on a request/reply socket. The command names are a fixed table; they are
//! modelled as [`DriverCommand`] so a typo is a compile error rather than a
//! driver-side "unknown command".

mod client;
mod params;
mod zmq;

pub use client::DriverClient;
pub use params::{command_timeout, coerce_value, validate_parameters, ParameterType};
pub use zmq::ZmqTransport;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Network location of a driver's command socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverEndpoint {
    pub host: String,
    pub port: u16,
}

impl DriverEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// ZeroMQ endpoint string.
    pub fn zmq_address(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for DriverEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Commands understood by driver processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverCommand {
    ProcessEcho,
    ExecuteResource,
    SetInitParams,
    StopDriverProcess,
    OverallState,
    GetResourceState,
    GetResource,
    SetResource,
    SetLogLevel,
}

impl DriverCommand {
    pub const ALL: [DriverCommand; 9] = [
        DriverCommand::ProcessEcho,
        DriverCommand::ExecuteResource,
        DriverCommand::SetInitParams,
        DriverCommand::StopDriverProcess,
        DriverCommand::OverallState,
        DriverCommand::GetResourceState,
        DriverCommand::GetResource,
        DriverCommand::SetResource,
        DriverCommand::SetLogLevel,
    ];

    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverCommand::ProcessEcho => "process_echo",
            DriverCommand::ExecuteResource => "execute_resource",
            DriverCommand::SetInitParams => "set_init_params",
            DriverCommand::StopDriverProcess => "stop_driver_process",
            DriverCommand::OverallState => "overall_state",
            DriverCommand::GetResourceState => "get_resource_state",
            DriverCommand::GetResource => "get_resource",
            DriverCommand::SetResource => "set_resource",
            DriverCommand::SetLogLevel => "set_log_level",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.as_str() == name)
    }
}

impl fmt::Display for DriverCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request envelope sent to a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub cmd: DriverCommand,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn new(cmd: DriverCommand) -> Self {
        Self {
            cmd,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_string(), value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs.extend(kwargs);
        self
    }
}

/// Request/reply transport to a driver process.
#[async_trait]
pub trait DriverTransport: Send + Sync + 'static {
    /// Send `envelope` and wait up to `timeout` for the reply.
    ///
    /// Fails with [`AgentError::Timeout`](crate::AgentError::Timeout) when no
    /// reply arrives in time.
    async fn request(
        &self,
        endpoint: &DriverEndpoint,
        envelope: &CommandEnvelope,
        timeout: Duration,
    ) -> Result<Value>;
}
