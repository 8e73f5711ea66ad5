//! Typed command client for one driver.

use super::params::{command_timeout, validate_parameters};
use super::{CommandEnvelope, DriverCommand, DriverEndpoint, DriverTransport};
use crate::config::DriverConfig;
use crate::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Command used to look up the timeout for `set_resource`.
const SET_RESOURCE_EVENT: &str = "DRIVER_EVENT_SET";
const DISCOVER_EVENT: &str = "DRIVER_EVENT_DISCOVER";

/// Client for a single driver process.
///
/// Every method takes an optional timeout. Plain commands default to
/// [`DriverConfig::COMMAND_TIMEOUT`]; `execute`, `discover` and
/// `set_resource` fetch the driver state first and use the timeout the
/// driver advertises for the command.
#[derive(Clone)]
pub struct DriverClient {
    endpoint: DriverEndpoint,
    transport: Arc<dyn DriverTransport>,
}

impl std::fmt::Debug for DriverClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl DriverClient {
    pub fn new(endpoint: DriverEndpoint, transport: Arc<dyn DriverTransport>) -> Self {
        Self {
            endpoint,
            transport,
        }
    }

    pub fn endpoint(&self) -> &DriverEndpoint {
        &self.endpoint
    }

    async fn send(&self, envelope: CommandEnvelope, timeout: Option<Duration>) -> Result<Value> {
        let timeout = timeout.unwrap_or(DriverConfig::COMMAND_TIMEOUT);
        debug!(
            "{} {} (timeout {}ms)",
            self.endpoint,
            envelope.cmd,
            timeout.as_millis()
        );
        self.transport
            .request(&self.endpoint, &envelope, timeout)
            .await
    }

    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Value> {
        self.send(CommandEnvelope::new(DriverCommand::ProcessEcho), timeout)
            .await
    }

    pub async fn get_state(&self, timeout: Option<Duration>) -> Result<Value> {
        self.send(CommandEnvelope::new(DriverCommand::OverallState), timeout)
            .await
    }

    pub async fn get_resource_state(&self, timeout: Option<Duration>) -> Result<Value> {
        self.send(CommandEnvelope::new(DriverCommand::GetResourceState), timeout)
            .await
    }

    pub async fn get_resource(&self, resource: Value, timeout: Option<Duration>) -> Result<Value> {
        self.send(
            CommandEnvelope::new(DriverCommand::GetResource).arg(resource),
            timeout,
        )
        .await
    }

    pub async fn set_init_params(&self, config: Value, timeout: Option<Duration>) -> Result<Value> {
        self.send(
            CommandEnvelope::new(DriverCommand::SetInitParams).arg(config),
            timeout,
        )
        .await
    }

    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<Value> {
        self.send(CommandEnvelope::new(DriverCommand::StopDriverProcess), timeout)
            .await
    }

    pub async fn set_log_level(&self, level: Value, timeout: Option<Duration>) -> Result<Value> {
        self.send(
            CommandEnvelope::new(DriverCommand::SetLogLevel).kwarg("level", level),
            timeout,
        )
        .await
    }

    /// Execute a driver resource command such as `DRIVER_EVENT_ACQUIRE_SAMPLE`.
    pub async fn execute(
        &self,
        command: &str,
        kwargs: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = match timeout {
            Some(timeout) => timeout,
            None => command_timeout(&self.get_state(None).await?, command),
        };
        self.send(
            CommandEnvelope::new(DriverCommand::ExecuteResource)
                .arg(command)
                .kwargs(kwargs),
            Some(timeout),
        )
        .await
    }

    pub async fn discover(&self, timeout: Option<Duration>) -> Result<Value> {
        self.execute(DISCOVER_EVENT, Map::new(), timeout).await
    }

    /// Validate `resource` against the driver's parameter metadata and set it.
    ///
    /// Nothing is sent to the driver if any parameter fails validation.
    pub async fn set_resource(
        &self,
        resource: &Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let state = self.get_state(None).await?;
        let validated = validate_parameters(&state, resource)?;
        let timeout = timeout.unwrap_or_else(|| command_timeout(&state, SET_RESOURCE_EVENT));
        self.send(
            CommandEnvelope::new(DriverCommand::SetResource).arg(Value::Object(validated)),
            Some(timeout),
        )
        .await
    }
}
