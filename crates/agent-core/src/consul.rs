//! Consul HTTP API client.
//!
//! Implements both [`KvStore`] (KV, sessions, acquire/release) and
//! [`ServiceRegistry`] (health-filtered service catalog) against a Consul
//! agent. Only the handful of endpoints the agent needs are covered:
//!
//! - `GET/PUT/DELETE /v1/kv/<key>` with `cas`, `acquire`, `release`, `recurse`
//! - `PUT /v1/session/create`, `PUT /v1/session/destroy/<id>`
//! - `GET /v1/health/service/<name>?tag=..&passing=true`

use crate::config::RegistryConfig;
use crate::kv::{KvEntry, KvStore, SessionId};
use crate::registry::{ServiceInstance, ServiceRegistry};
use crate::{AgentError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulKvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    modify_index: u64,
    #[serde(default)]
    session: Option<String>,
}

impl ConsulKvPair {
    fn into_entry(self) -> Result<KvEntry> {
        let value = match self.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| AgentError::store(format!("bad value for {}: {}", self.key, e)))?,
            None => Vec::new(),
        };
        Ok(KvEntry {
            key: self.key,
            value: Bytes::from(value),
            modify_index: self.modify_index,
            session: self.session.map(SessionId::new),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCreate<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'a str,
    lock_delay: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    node: String,
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl From<HealthEntry> for ServiceInstance {
    fn from(entry: HealthEntry) -> Self {
        ServiceInstance {
            node: entry.node.node,
            address: entry.node.address,
            port: entry.service.port,
            tags: entry.service.tags.unwrap_or_default(),
        }
    }
}

/// Client for a Consul agent's HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    client: Client,
    base: Url,
}

impl ConsulClient {
    /// Create a client for the agent at `base_url` (e.g. `http://127.0.0.1:8500`).
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, RegistryConfig::REQUEST_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).map_err(|e| AgentError::Config {
            message: format!("invalid Consul URL {}: {}", base_url, e),
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent("instrument-agent/0.1")
            .build()?;

        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|e| AgentError::Config {
            message: format!("invalid Consul path {}: {}", path, e),
        })
    }

    fn kv_url(&self, key: &str) -> Result<Url> {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        self.url(&format!("v1/kv/{}", encoded.join("/")))
    }

    /// Send a KV or session request; transport and status failures become
    /// store errors.
    async fn send_kv(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| AgentError::store(format!("{} failed: {}", what, e)))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::store(format!(
            "{} returned {}: {}",
            what,
            status,
            body.trim()
        )))
    }

    async fn read_bool(response: Response, what: &str) -> Result<bool> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response
            .json::<bool>()
            .await
            .map_err(|e| AgentError::store(format!("{} returned a non-boolean body: {}", what, e)))
    }

    async fn read_pairs(response: Response, what: &str) -> Result<Vec<KvEntry>> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let pairs: Vec<ConsulKvPair> = response
            .json()
            .await
            .map_err(|e| AgentError::store(format!("{} returned bad JSON: {}", what, e)))?;
        pairs.into_iter().map(ConsulKvPair::into_entry).collect()
    }
}

#[async_trait]
impl KvStore for ConsulClient {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let request = self.client.get(self.kv_url(key)?);
        let response = self.send_kv(request, "KV get").await?;
        Ok(Self::read_pairs(response, "KV get").await?.into_iter().next())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let request = self
            .client
            .get(self.kv_url(prefix)?)
            .query(&[("recurse", "true")]);
        let response = self.send_kv(request, "KV list").await?;
        Self::read_pairs(response, "KV list").await
    }

    async fn put_cas(&self, key: &str, value: &[u8], cas: u64) -> Result<bool> {
        let request = self
            .client
            .put(self.kv_url(key)?)
            .query(&[("cas", cas.to_string())])
            .body(value.to_vec());
        let response = self.send_kv(request, "KV put").await?;
        Self::read_bool(response, "KV put").await
    }

    async fn delete_cas(&self, key: &str, cas: u64) -> Result<bool> {
        let request = self
            .client
            .delete(self.kv_url(key)?)
            .query(&[("cas", cas.to_string())]);
        let response = self.send_kv(request, "KV delete").await?;
        Self::read_bool(response, "KV delete").await
    }

    async fn create_session(&self, name: &str, ttl: Duration) -> Result<SessionId> {
        // Consul rejects session TTLs under 10s
        let body = SessionCreate {
            name,
            ttl: format!("{}s", ttl.as_secs().max(10)),
            behavior: "release",
            lock_delay: "0s",
        };
        let request = self.client.put(self.url("v1/session/create")?).json(&body);
        let response = self.send_kv(request, "session create").await?;
        let created: SessionCreated = response
            .json()
            .await
            .map_err(|e| AgentError::store(format!("session create returned bad JSON: {}", e)))?;
        debug!("Created Consul session {}", created.id);
        Ok(SessionId::new(created.id))
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        let path = format!("v1/session/destroy/{}", urlencoding::encode(session.as_str()));
        let request = self.client.put(self.url(&path)?);
        self.send_kv(request, "session destroy").await?;
        Ok(())
    }

    async fn acquire(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool> {
        let request = self
            .client
            .put(self.kv_url(key)?)
            .query(&[("acquire", session.as_str())])
            .body(value.to_vec());
        let response = self.send_kv(request, "KV acquire").await?;
        Self::read_bool(response, "KV acquire").await
    }

    async fn release(&self, key: &str, session: &SessionId) -> Result<bool> {
        let request = self
            .client
            .put(self.kv_url(key)?)
            .query(&[("release", session.as_str())]);
        let response = self.send_kv(request, "KV release").await?;
        Self::read_bool(response, "KV release").await
    }
}

#[async_trait]
impl ServiceRegistry for ConsulClient {
    async fn query(
        &self,
        service: &str,
        tag: Option<&str>,
        passing_only: bool,
    ) -> Result<Vec<ServiceInstance>> {
        let path = format!("v1/health/service/{}", urlencoding::encode(service));
        let mut request = self.client.get(self.url(&path)?);
        if let Some(tag) = tag {
            request = request.query(&[("tag", tag)]);
        }
        if passing_only {
            request = request.query(&[("passing", "true")]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Network {
                message: format!("health query for {} returned {}", service, status),
                cause: None,
            });
        }

        let entries: Vec<HealthEntry> = response.json().await?;
        Ok(entries.into_iter().map(ServiceInstance::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_pair_decodes_base64_value() {
        let json = r#"[{"Key":"lock/CE01","Value":"b3BlcmF0b3I=","ModifyIndex":42,"Flags":0}]"#;
        let pairs: Vec<ConsulKvPair> = serde_json::from_str(json).unwrap();
        let entry = pairs.into_iter().next().unwrap().into_entry().unwrap();
        assert_eq!(entry.key, "lock/CE01");
        assert_eq!(entry.value_str(), "operator");
        assert_eq!(entry.modify_index, 42);
        assert!(entry.session.is_none());
    }

    #[test]
    fn test_kv_pair_null_value_is_empty() {
        let json = r#"{"Key":"lock/master","Value":null,"ModifyIndex":7,"Session":"abc"}"#;
        let pair: ConsulKvPair = serde_json::from_str(json).unwrap();
        let entry = pair.into_entry().unwrap();
        assert!(entry.holder().is_none());
        assert_eq!(entry.session, Some(SessionId::new("abc")));
    }

    #[test]
    fn test_health_entry_uses_node_address() {
        let json = r#"[{
            "Node": {"Node": "node-1", "Address": "10.0.0.5"},
            "Service": {"Address": "", "Port": 4000, "Tags": ["X1"]},
            "Checks": []
        }]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(json).unwrap();
        let instance: ServiceInstance = entries.into_iter().next().unwrap().into();
        assert_eq!(instance.endpoint(), "10.0.0.5:4000");
        assert_eq!(instance.node, "node-1");
        assert_eq!(instance.tags, vec!["X1"]);
    }

    #[test]
    fn test_kv_url_encodes_segments() {
        let client = ConsulClient::new("http://127.0.0.1:8500").unwrap();
        let url = client.kv_url("lock/CE01 CTD").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8500/v1/kv/lock/CE01%20CTD");
    }

    #[test]
    fn test_session_create_body() {
        let body = SessionCreate {
            name: "master",
            ttl: "10s".into(),
            behavior: "release",
            lock_delay: "0s",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["TTL"], "10s");
        assert_eq!(json["Behavior"], "release");
        assert_eq!(json["LockDelay"], "0s");
    }
}
