//! In-memory registry.
//!
//! Used when running without Consul and as the registry in tests.

use super::{ServiceInstance, ServiceRegistry};
use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
struct Registration {
    service: String,
    instance: ServiceInstance,
    passing: bool,
}

/// Registry backed by an in-process list of registrations.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    registrations: Arc<RwLock<Vec<Registration>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a passing instance of `service`.
    pub fn register(&self, service: &str, instance: ServiceInstance) {
        self.register_with_health(service, instance, true);
    }

    /// Register an instance with an explicit health state.
    pub fn register_with_health(&self, service: &str, instance: ServiceInstance, passing: bool) {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        registrations.push(Registration {
            service: service.to_string(),
            instance,
            passing,
        });
    }

    /// Remove every instance of `service` carrying `tag`.
    pub fn deregister(&self, service: &str, tag: &str) {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        registrations.retain(|r| !(r.service == service && r.instance.tags.iter().any(|t| t == tag)));
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn query(
        &self,
        service: &str,
        tag: Option<&str>,
        passing_only: bool,
    ) -> Result<Vec<ServiceInstance>> {
        let registrations = self
            .registrations
            .read()
            .unwrap_or_else(|e| e.into_inner());
        Ok(registrations
            .iter()
            .filter(|r| r.service == service)
            .filter(|r| !passing_only || r.passing)
            .filter(|r| match tag {
                Some(tag) => r.instance.tags.iter().any(|t| t == tag),
                None => true,
            })
            .map(|r| r.instance.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_filters_by_tag_and_health() {
        let registry = StaticRegistry::new();
        registry.register(
            "sniff-port-agent",
            ServiceInstance::new("10.0.0.5", 4000).with_tag("X1"),
        );
        registry.register_with_health(
            "sniff-port-agent",
            ServiceInstance::new("10.0.0.6", 4000).with_tag("X1"),
            false,
        );
        registry.register(
            "sniff-port-agent",
            ServiceInstance::new("10.0.0.7", 4000).with_tag("X2"),
        );

        let passing = registry
            .query("sniff-port-agent", Some("X1"), true)
            .await
            .unwrap();
        assert_eq!(passing.len(), 1);
        assert_eq!(passing[0].endpoint(), "10.0.0.5:4000");

        let all = registry
            .query("sniff-port-agent", Some("X1"), false)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let untagged = registry.query("sniff-port-agent", None, true).await.unwrap();
        assert_eq!(untagged.len(), 2);
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = StaticRegistry::new();
        registry.register("port-agent", ServiceInstance::new("h", 1).with_tag("X1"));
        registry.deregister("port-agent", "X1");
        assert!(registry
            .query("port-agent", Some("X1"), true)
            .await
            .unwrap()
            .is_empty());
    }
}
