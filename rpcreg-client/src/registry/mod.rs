//! # Registry contract
//!
//! [`Registry`] is the capability set every coordination store backend provides:
//! service registration with a TTL health check, check pass/fail reporting,
//! blocking health lookups and command reads.
//!
//! Two backends ship with the crate:
//! - [`HttpRegistry`]: talks to a store exposing a Consul-style HTTP API.
//! - [`MemoryRegistry`]: an in-process store with the same blocking semantics,
//!   for embedded use and tests.

mod http;
mod memory;

use crate::error::{InstanceConversionError, RegistryError};
use async_trait::async_trait;
use derive_builder::Builder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

pub use http::HttpRegistry;
pub use memory::MemoryRegistry;

/// Prefix of the logical service name derived from a group
pub const SERVICE_NAME_PREFIX: &str = "rpcreg_";
/// Key prefix under which operators push commands
pub const COMMAND_KEY_PREFIX: &str = "rpcreg/command/";
/// Service meta key carrying the registered ttl
pub(crate) const META_TTL_SECONDS: &str = "ttl_seconds";

/// Logical service name for a group.
pub fn convert_group_to_service_name(group: &str) -> String {
    format!("{}{}", SERVICE_NAME_PREFIX, group)
}

/// Store key holding the command of a group.
///
/// Distinct groups always map to distinct keys.
pub fn command_key(group: &str) -> String {
    format!("{}{}", COMMAND_KEY_PREFIX, convert_group_to_service_name(group))
}

/// Check id associated with a registered instance.
pub fn check_id(instance_id: &str) -> String {
    format!("service:{}", instance_id)
}

/// A registered service instance.
///
/// Re-registering with the same id replaces the previous registration.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct ServiceInstance {
    /// Unique per registration
    #[builder(setter(into))]
    pub id: String,
    /// Logical service name
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub address: String,
    pub port: u16,
    #[builder(default)]
    pub tags: BTreeSet<String>,
    /// Check turns critical when no heartbeat arrives within this window.
    /// 0 when the store did not report it.
    #[builder(default)]
    pub ttl_seconds: u64,
}

impl ServiceInstance {
    /// Parse one raw health record as returned by a blocking health query.
    pub fn from_health_record(record: &Value) -> Result<Self, InstanceConversionError> {
        let record = HealthRecord::deserialize(record)?;
        let service = record.service;
        if service.id.is_empty() {
            return Err(InstanceConversionError::EmptyId);
        }
        if service.port == 0 {
            return Err(InstanceConversionError::InvalidPort {
                id: service.id,
                port: service.port,
            });
        }
        let ttl_seconds = match service.meta.get(META_TTL_SECONDS) {
            None => 0,
            Some(value) => {
                value
                    .parse::<u64>()
                    .map_err(|_| InstanceConversionError::InvalidTtl {
                        id: service.id.clone(),
                        value: value.clone(),
                    })?
            }
        };
        Ok(ServiceInstance {
            id: service.id,
            name: service.service,
            address: service.address,
            port: service.port,
            tags: service.tags.unwrap_or_default().into_iter().collect(),
            ttl_seconds,
        })
    }

    /// Raw health record shape of this instance, the inverse of [`Self::from_health_record`].
    pub(crate) fn to_health_record(&self) -> Value {
        serde_json::json!({
            "Service": {
                "ID": self.id,
                "Service": self.name,
                "Address": self.address,
                "Port": self.port,
                "Tags": self.tags,
                "Meta": { META_TTL_SECONDS: self.ttl_seconds.to_string() },
            }
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthRecord {
    service: HealthService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: HashMap<String, String>,
}

/// Convert one round of raw health records.
///
/// Malformed records are logged and skipped; they never fail the round.
pub fn convert_health_records(records: &[Value]) -> Vec<ServiceInstance> {
    let mut instances = Vec::with_capacity(records.len());
    for record in records {
        match ServiceInstance::from_health_record(record) {
            Ok(instance) => instances.push(instance),
            Err(e) => {
                let id = record
                    .pointer("/Service/ID")
                    .and_then(Value::as_str)
                    .unwrap_or("null");
                log::error!("convert health record failed, service id: {}, error: {}", id, e);
            }
        }
    }
    instances
}

/// Result of one blocking lookup round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub instances: Vec<ServiceInstance>,
    /// Opaque cursor to pass to the next lookup
    pub store_index: u64,
    pub last_contact_millis: u64,
    pub known_leader: bool,
}

/// An operator-pushed command for a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub group: String,
    /// Empty when no command is stored for the group
    pub payload: String,
}

impl Command {
    pub fn empty(group: &str) -> Self {
        Command {
            group: group.to_string(),
            payload: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.trim().is_empty()
    }

    /// Decode a JSON payload. `None` when there is no command.
    pub fn decode<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&self.payload)?))
    }
}

/// Body sent to the store to register an instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct RegisterReq {
    #[serde(rename = "ID")]
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) tags: Vec<String>,
    pub(crate) meta: HashMap<String, String>,
    pub(crate) check: CheckReq,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CheckReq {
    #[serde(rename = "CheckID")]
    pub(crate) check_id: String,
    #[serde(rename = "TTL")]
    pub(crate) ttl: String,
}

impl From<&ServiceInstance> for RegisterReq {
    fn from(instance: &ServiceInstance) -> Self {
        RegisterReq {
            id: instance.id.clone(),
            name: instance.name.clone(),
            address: instance.address.clone(),
            port: instance.port,
            tags: instance.tags.iter().cloned().collect(),
            meta: HashMap::from([(
                META_TTL_SECONDS.to_string(),
                instance.ttl_seconds.to_string(),
            )]),
            check: CheckReq {
                check_id: check_id(&instance.id),
                ttl: format!("{}s", instance.ttl_seconds),
            },
        }
    }
}

/// Capability set of a coordination store backend.
///
/// Implementations never retry: every failure is returned to the caller.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Upsert an instance together with its TTL check.
    async fn register_service(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    /// Remove an instance and its check.
    async fn deregister_service(&self, instance_id: &str) -> Result<(), RegistryError>;

    /// Mark the instance check as passing.
    async fn check_pass(&self, instance_id: &str) -> Result<(), RegistryError>;

    /// Mark the instance check as critical.
    async fn check_fail(&self, instance_id: &str) -> Result<(), RegistryError>;

    /// Blocking lookup of passing instances of `service_name`.
    ///
    /// Returns once the store state moves past `since_index`, or after `wait`
    /// with the same index. Fails with [`RegistryError::DiscoveryUnavailable`]
    /// when the store cannot be reached.
    async fn lookup_health_service(
        &self,
        service_name: &str,
        since_index: u64,
        wait: Duration,
    ) -> Result<DiscoveryResult, RegistryError>;

    /// Point read of the command stored for `group`. Empty when missing.
    async fn lookup_command(&self, group: &str) -> Result<String, RegistryError>;
}
