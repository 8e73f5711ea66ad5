//! Registry lookups used by the web layer and the sniffer broker.

use super::{ServiceInstance, ServiceRegistry};
use crate::config::RegistryConfig;
use crate::driver::DriverEndpoint;
use crate::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Host and port of one port agent service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAgentInfo {
    pub host: String,
    pub port: u16,
}

/// First passing instance of `service` tagged `tag` with a usable address.
async fn first_passing(
    registry: &dyn ServiceRegistry,
    service: &str,
    tag: &str,
) -> Result<Option<ServiceInstance>> {
    let matches = registry.query(service, Some(tag), true).await?;
    Ok(matches
        .into_iter()
        .find(|instance| !instance.address.is_empty() && instance.port != 0))
}

/// Resolve the RPC endpoint of a driver.
pub async fn locate_driver(
    registry: &dyn ServiceRegistry,
    driver_id: &str,
) -> Result<DriverEndpoint> {
    match first_passing(registry, RegistryConfig::DRIVER_SERVICE, driver_id).await? {
        Some(instance) => Ok(DriverEndpoint::new(instance.address, instance.port)),
        None => Err(AgentError::DriverNotFound {
            driver_id: driver_id.to_string(),
        }),
    }
}

/// Resolve the single passing instance of `service` tagged `tag`.
///
/// Zero matches and several matches are both reported as
/// [`AgentError::DiscoveryFailed`]; an ambiguous registration is not
/// something to guess about.
pub async fn locate_unique(
    registry: &dyn ServiceRegistry,
    service: &str,
    tag: &str,
) -> Result<ServiceInstance> {
    let mut matches = registry.query(service, Some(tag), true).await?;
    if matches.len() == 1 {
        if let Some(instance) = matches.pop() {
            return Ok(instance);
        }
    }
    debug!(
        "Expected one passing {} for {}, found {}",
        service,
        tag,
        matches.len()
    );
    Err(AgentError::DiscoveryFailed {
        service: service.to_string(),
        tag: tag.to_string(),
    })
}

/// Reference designators of every passing driver.
pub async fn list_drivers(registry: &dyn ServiceRegistry) -> Result<Vec<String>> {
    let passing = registry
        .query(RegistryConfig::DRIVER_SERVICE, None, true)
        .await?;
    Ok(passing.into_iter().flat_map(|instance| instance.tags).collect())
}

/// Port agent endpoints registered for a driver, keyed by role.
///
/// Roles with no passing instance are left out.
pub async fn port_agents(
    registry: &dyn ServiceRegistry,
    driver_id: &str,
) -> Result<BTreeMap<String, PortAgentInfo>> {
    let mut agents = BTreeMap::new();
    for (role, service) in RegistryConfig::PORT_AGENT_SERVICES {
        if let Some(instance) = first_passing(registry, service, driver_id).await? {
            agents.insert(
                role.to_string(),
                PortAgentInfo {
                    host: instance.address,
                    port: instance.port,
                },
            );
        }
    }
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;

    fn registry() -> StaticRegistry {
        let registry = StaticRegistry::new();
        registry.register(
            "instrument_driver",
            ServiceInstance::new("10.0.0.1", 5001).with_tag("CE01-CTD"),
        );
        registry.register(
            "instrument_driver",
            ServiceInstance::new("10.0.0.2", 5002).with_tag("CE02-ADCP"),
        );
        registry.register_with_health(
            "instrument_driver",
            ServiceInstance::new("10.0.0.3", 5003).with_tag("CE03-DOWN"),
            false,
        );
        registry.register(
            "port-agent",
            ServiceInstance::new("10.0.1.1", 4001).with_tag("CE01-CTD"),
        );
        registry.register(
            "sniff-port-agent",
            ServiceInstance::new("10.0.1.1", 4003).with_tag("CE01-CTD"),
        );
        registry
    }

    #[tokio::test]
    async fn test_locate_driver() {
        let registry = registry();
        let endpoint = locate_driver(&registry, "CE01-CTD").await.unwrap();
        assert_eq!(endpoint, DriverEndpoint::new("10.0.0.1", 5001));

        let missing = locate_driver(&registry, "CE03-DOWN").await;
        assert!(matches!(missing, Err(AgentError::DriverNotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_drivers_only_passing() {
        let registry = registry();
        let mut drivers = list_drivers(&registry).await.unwrap();
        drivers.sort();
        assert_eq!(drivers, vec!["CE01-CTD", "CE02-ADCP"]);
    }

    #[tokio::test]
    async fn test_port_agents_skips_missing_roles() {
        let registry = registry();
        let agents = port_agents(&registry, "CE01-CTD").await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents["data"].port, 4001);
        assert_eq!(agents["sniff"].port, 4003);
        assert!(!agents.contains_key("da"));
    }

    #[tokio::test]
    async fn test_locate_unique_rejects_ambiguity() {
        let registry = registry();
        registry.register(
            "sniff-port-agent",
            ServiceInstance::new("10.0.1.9", 4003).with_tag("CE01-CTD"),
        );
        let result = locate_unique(&registry, "sniff-port-agent", "CE01-CTD").await;
        assert!(matches!(result, Err(AgentError::DiscoveryFailed { .. })));

        let result = locate_unique(&registry, "sniff-port-agent", "NOPE").await;
        assert!(matches!(result, Err(AgentError::DiscoveryFailed { .. })));
    }
}
