//! Service discovery.
//!
//! Drivers and their port agents register in a service registry under a
//! service name, tagged with the driver's reference designator. The agent only
//! ever reads from the registry.

mod lookup;
mod static_registry;

pub use lookup::{list_drivers, locate_driver, locate_unique, port_agents, PortAgentInfo};
pub use static_registry::StaticRegistry;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One registered instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Node the instance runs on.
    pub node: String,
    /// Address to dial.
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ServiceInstance {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            node: address.clone(),
            address,
            port,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// `host:port` form for dialing and logging.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Read access to a service registry.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// Instances of `service`, optionally restricted to those tagged `tag`
    /// and to those whose health checks all pass.
    async fn query(
        &self,
        service: &str,
        tag: Option<&str>,
        passing_only: bool,
    ) -> Result<Vec<ServiceInstance>>;
}
