use crate::conf::{RegistryConfig, ServerAddr};
use crate::error::RegistryError;
use crate::network::{Network, RawResponse};
use crate::registry::{
    DiscoveryResult, RegisterReq, Registry, ServiceInstance, check_id, command_key,
    convert_health_records,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const INDEX_HEADER: &str = "X-Consul-Index";
const LAST_CONTACT_HEADER: &str = "X-Consul-LastContact";
const KNOWN_LEADER_HEADER: &str = "X-Consul-KnownLeader";

/// Backend for stores exposing a Consul-style HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    server_addr: ServerAddr,
    network: Network,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    #[serde(default)]
    value: Option<String>,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig) -> anyhow::Result<Self> {
        // The store adds up to wait/16 of jitter to a blocking query.
        let wait = config.wait();
        let read_timeout = wait + wait / 16 + Duration::from_secs(5);
        let network = Network::new(Duration::from_secs(1), read_timeout, config.token.clone())?;
        Ok(HttpRegistry {
            server_addr: config.server_addr.clone(),
            network,
        })
    }

    fn url(&self, path: &str) -> Result<String, RegistryError> {
        self.server_addr
            .build_url(path)
            .map_err(|e| RegistryError::RegistryUnavailable(e.to_string()))
    }

    /// Map a completed response onto the registry error taxonomy.
    fn check_status(
        response: &RawResponse,
        unavailable: fn(String) -> RegistryError,
    ) -> Result<(), RegistryError> {
        let status = response.status;
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(unavailable(format!("{}: {}", status, response.body)))
        } else {
            Err(RegistryError::Rejected {
                status: status.as_u16(),
                message: response.body.clone(),
            })
        }
    }

    async fn put_agent(&self, path: &str, body: Option<RegisterReq>) -> Result<(), RegistryError> {
        let url = self.url(path)?;
        let response = self
            .network
            .put(&url, body)
            .await
            .map_err(|e| RegistryError::RegistryUnavailable(e.to_string()))?;
        Self::check_status(&response, RegistryError::RegistryUnavailable)
    }

    /// Store a command for a group, as an operator would.
    pub async fn put_command(&self, group: &str, payload: &str) -> Result<(), RegistryError> {
        let url = self.url(&format!("/v1/kv/{}", command_key(group)))?;
        let response = self
            .network
            .put_bytes(&url, payload.as_bytes().to_vec())
            .await
            .map_err(|e| RegistryError::RegistryUnavailable(e.to_string()))?;
        Self::check_status(&response, RegistryError::RegistryUnavailable)
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn register_service(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.put_agent("/v1/agent/service/register", Some(RegisterReq::from(instance)))
            .await
    }

    async fn deregister_service(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.put_agent(&format!("/v1/agent/service/deregister/{}", instance_id), None)
            .await
    }

    async fn check_pass(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.put_agent(&format!("/v1/agent/check/pass/{}", check_id(instance_id)), None)
            .await
    }

    async fn check_fail(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.put_agent(&format!("/v1/agent/check/fail/{}", check_id(instance_id)), None)
            .await
    }

    async fn lookup_health_service(
        &self,
        service_name: &str,
        since_index: u64,
        wait: Duration,
    ) -> Result<DiscoveryResult, RegistryError> {
        let url = self
            .url(&format!("/v1/health/service/{}", service_name))
            .map_err(|e| RegistryError::DiscoveryUnavailable(e.to_string()))?;
        let query = [
            ("passing", "true".to_string()),
            ("index", since_index.to_string()),
            ("wait", format!("{}s", wait.as_secs())),
        ];
        let response = self
            .network
            .get(&url, &query)
            .await
            .map_err(|e| RegistryError::DiscoveryUnavailable(e.to_string()))?;
        Self::check_status(&response, RegistryError::DiscoveryUnavailable)?;

        let records = serde_json::from_str::<Vec<Value>>(&response.body).map_err(|e| {
            RegistryError::DiscoveryUnavailable(format!("unreadable health response: {}", e))
        })?;

        Ok(DiscoveryResult {
            instances: convert_health_records(&records),
            store_index: response.header_u64(INDEX_HEADER).unwrap_or(since_index),
            last_contact_millis: response.header_u64(LAST_CONTACT_HEADER).unwrap_or_default(),
            known_leader: response.header_bool(KNOWN_LEADER_HEADER).unwrap_or(false),
        })
    }

    async fn lookup_command(&self, group: &str) -> Result<String, RegistryError> {
        let url = self.url(&format!("/v1/kv/{}", command_key(group)))?;
        let response = self
            .network
            .get(&url, &[] as &[(&str, &str)])
            .await
            .map_err(|e| RegistryError::RegistryUnavailable(e.to_string()))?;
        if response.status == StatusCode::NOT_FOUND {
            log::info!("no command in group: {}", group);
            return Ok(String::new());
        }
        Self::check_status(&response, RegistryError::RegistryUnavailable)?;

        let entries = match serde_json::from_str::<Vec<KvEntry>>(&response.body) {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("unreadable command of group {}: {}", group, e);
                return Ok(String::new());
            }
        };
        let Some(encoded) = entries.into_iter().next().and_then(|entry| entry.value) else {
            return Ok(String::new());
        };
        match STANDARD.decode(encoded.as_bytes()) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                log::error!("command of group {} is not valid base64: {}", group, e);
                Ok(String::new())
            }
        }
    }
}
