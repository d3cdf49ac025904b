//! Configuration component
//!
//! Loaded from the `rpcreg` key of `bootstrap.yaml`, or assembled in code through the
//! generated builders:
//!
//! ```yaml
//! rpcreg:
//!   service-name: orders
//!   client:
//!     address: 10.0.0.5
//!     port: 9090
//!     ttl-seconds: 10
//!   registry:
//!     server-addr: 127.0.0.1:8500
//!   metrics:
//!     enable-latency-histograms: true
//!   references:
//!     - group: payments
//!       call-type: future
//! ```
use crate::utils;
use derive_builder::Builder;
use serde::Deserialize;
use std::time::Duration;

/// Wrapped because the top-level key in bootstrap.yaml is rpcreg
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcregConfigWrapper {
    pub(crate) rpcreg: RpcregConfig,
}

#[derive(Debug, Clone, Deserialize, Builder)]
#[serde(rename_all = "kebab-case")]
pub struct RpcregConfig {
    /// Logical service name this process registers under
    #[serde(default = "RpcregConfig::default_service_name")]
    #[builder(setter(into), default = "RpcregConfig::default_service_name()")]
    pub service_name: String,
    /// Registration of this process. Nothing is registered when absent.
    #[serde(default)]
    #[builder(setter(strip_option), default)]
    pub client: Option<ClientConfig>,
    /// Coordination store connection
    #[builder(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    #[builder(default)]
    pub metrics: MetricsConfig,
    /// Remote references resolved by the binding layer
    #[serde(default)]
    #[builder(default)]
    pub references: Vec<ReferenceConfig>,
}

impl RpcregConfig {
    fn default_service_name() -> String {
        utils::current_process_name()
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(untagged)]
pub enum ServerAddr {
    Single(String),
    Cluster(Vec<String>),
    #[default]
    Unset,
}

impl From<&str> for ServerAddr {
    fn from(value: &str) -> Self {
        ServerAddr::Single(value.to_string())
    }
}
impl From<String> for ServerAddr {
    fn from(value: String) -> Self {
        ServerAddr::Single(value)
    }
}
impl From<Vec<&str>> for ServerAddr {
    fn from(value: Vec<&str>) -> Self {
        ServerAddr::Cluster(value.into_iter().map(|s| s.to_string()).collect())
    }
}
impl From<Vec<String>> for ServerAddr {
    fn from(value: Vec<String>) -> Self {
        ServerAddr::Cluster(value)
    }
}

/// The instance this process registers.
#[derive(Debug, Deserialize, Clone, Builder)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    #[serde(default = "ClientConfig::default_address")]
    #[builder(setter(into), default = "ClientConfig::default_address()")]
    pub address: String,
    pub port: u16,
    /// Explicit instance id, generated from name, address and port when absent
    #[serde(default)]
    #[builder(setter(into, strip_option), default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub tags: Vec<String>,
    /// The check turns critical when no heartbeat arrives within this many seconds
    #[serde(default = "ClientConfig::default_ttl_seconds")]
    #[builder(default = "ClientConfig::default_ttl_seconds()")]
    pub ttl_seconds: u64,
    /// Heartbeat period; no heartbeat task is started when set to 0
    #[serde(default = "ClientConfig::default_heartbeat_interval_seconds")]
    #[builder(default = "ClientConfig::default_heartbeat_interval_seconds()")]
    pub heartbeat_interval_seconds: u64,
}

impl ClientConfig {
    pub fn gen_instance_id(&self, service_name: &str) -> String {
        if let Some(id) = &self.instance_id {
            return id.clone();
        }
        let digest = md5::compute(format!("{}:{}", self.address, self.port));
        format!("{}-{:x}", service_name, digest)
    }
    pub fn default_address() -> String {
        "127.0.0.1".to_string()
    }
    fn default_ttl_seconds() -> u64 {
        10
    }
    fn default_heartbeat_interval_seconds() -> u64 {
        3
    }
}

#[derive(Debug, Clone, Deserialize, Builder)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Store address, e.g. 127.0.0.1:8500, or a list of cluster members
    #[serde(default)]
    #[builder(setter(into), default)]
    pub server_addr: ServerAddr,
    /// ACL token sent with every request
    #[serde(default)]
    #[builder(setter(into, strip_option), default)]
    pub token: Option<String>,
    /// Server-side wait window of a blocking lookup
    #[serde(default = "RegistryConfig::default_wait_seconds")]
    #[builder(default = "RegistryConfig::default_wait_seconds()")]
    pub wait_seconds: u64,
    #[serde(default = "RegistryConfig::default_retry_backoff_min_millis")]
    #[builder(default = "RegistryConfig::default_retry_backoff_min_millis()")]
    pub retry_backoff_min_millis: u64,
    #[serde(default = "RegistryConfig::default_retry_backoff_max_millis")]
    #[builder(default = "RegistryConfig::default_retry_backoff_max_millis()")]
    pub retry_backoff_max_millis: u64,
    /// Ignore an empty lookup result when a non-empty one is already cached
    #[serde(default = "RegistryConfig::default_keep_last_on_empty")]
    #[builder(default = "RegistryConfig::default_keep_last_on_empty()")]
    pub keep_last_on_empty: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            server_addr: ServerAddr::Unset,
            token: None,
            wait_seconds: Self::default_wait_seconds(),
            retry_backoff_min_millis: Self::default_retry_backoff_min_millis(),
            retry_backoff_max_millis: Self::default_retry_backoff_max_millis(),
            keep_last_on_empty: Self::default_keep_last_on_empty(),
        }
    }
}

impl RegistryConfig {
    fn default_wait_seconds() -> u64 {
        30
    }
    fn default_retry_backoff_min_millis() -> u64 {
        1000
    }
    fn default_retry_backoff_max_millis() -> u64 {
        30_000
    }
    fn default_keep_last_on_empty() -> bool {
        true
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }

    pub fn retry_backoff(&self) -> (Duration, Duration) {
        let min = Duration::from_millis(self.retry_backoff_min_millis.max(1));
        let max = Duration::from_millis(self.retry_backoff_max_millis).max(min);
        (min, max)
    }
}

#[derive(Debug, Clone, Deserialize, Builder)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsConfig {
    #[serde(default)]
    #[builder(default)]
    pub enable_latency_histograms: bool,
    /// Upper bounds in seconds, strictly increasing
    #[serde(default = "MetricsConfig::default_latency_buckets")]
    #[builder(default = "MetricsConfig::default_latency_buckets()")]
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enable_latency_histograms: false,
            latency_buckets: Self::default_latency_buckets(),
        }
    }
}

impl MetricsConfig {
    pub fn default_latency_buckets() -> Vec<f64> {
        vec![
            0.001, 0.005, 0.01, 0.05, 0.075, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0,
        ]
    }
}

/// How the caller consumes the result of a remote call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallType {
    /// Awaited inline on the calling task
    Blocking,
    /// Spawned, the caller gets a handle to await later
    #[default]
    Future,
    /// Spawned, a callback receives the result
    Async,
}

impl CallType {
    /// Whether the call completes on a task other than the caller's.
    pub fn requires_reattach(&self) -> bool {
        !matches!(self, CallType::Blocking)
    }
}

/// A remote reference as resolved by the binding layer.
#[derive(Debug, Clone, Deserialize, Builder)]
#[serde(rename_all = "kebab-case")]
pub struct ReferenceConfig {
    #[serde(default = "ReferenceConfig::default_group")]
    #[builder(setter(into), default = "ReferenceConfig::default_group()")]
    pub group: String,
    #[serde(default = "ReferenceConfig::default_version")]
    #[builder(setter(into), default = "ReferenceConfig::default_version()")]
    pub version: String,
    #[serde(default)]
    #[builder(default)]
    pub call_type: CallType,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            group: Self::default_group(),
            version: Self::default_version(),
            call_type: CallType::default(),
        }
    }
}

impl ReferenceConfig {
    fn default_group() -> String {
        "default".to_string()
    }
    fn default_version() -> String {
        "1.0.0".to_string()
    }

    /// Logical service name whose instances back this reference.
    pub fn service_name(&self) -> String {
        crate::registry::convert_group_to_service_name(&self.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap() {
        let yaml = r#"
rpcreg:
  service-name: orders
  client:
    address: 10.0.0.5
    port: 9090
    tags: [grpc]
  registry:
    server-addr:
      - 127.0.0.1:8500
      - 127.0.0.1:8501
    wait-seconds: 20
  metrics:
    enable-latency-histograms: true
  references:
    - group: payments
      call-type: async
"#;
        let config = serde_yaml::from_str::<RpcregConfigWrapper>(yaml)
            .unwrap()
            .rpcreg;
        assert_eq!(config.service_name, "orders");
        let client = config.client.unwrap();
        assert_eq!(client.port, 9090);
        assert_eq!(client.ttl_seconds, 10);
        assert_eq!(client.tags, vec!["grpc".to_string()]);
        assert!(matches!(config.registry.server_addr, ServerAddr::Cluster(ref v) if v.len() == 2));
        assert_eq!(config.registry.wait(), Duration::from_secs(20));
        assert!(config.registry.keep_last_on_empty);
        assert!(config.metrics.enable_latency_histograms);
        assert_eq!(config.metrics.latency_buckets.len(), 12);
        assert_eq!(config.references[0].call_type, CallType::Async);
        assert_eq!(config.references[0].version, "1.0.0");
        assert_eq!(config.references[0].service_name(), "rpcreg_payments");
    }

    #[test]
    fn test_instance_id() {
        let client = ClientConfigBuilder::default()
            .address("10.0.0.5")
            .port(9090)
            .build()
            .unwrap();
        let id = client.gen_instance_id("orders");
        assert!(id.starts_with("orders-"));
        assert_eq!(id, client.gen_instance_id("orders"));

        let client = ClientConfigBuilder::default()
            .port(9090)
            .instance_id("svc-1")
            .build()
            .unwrap();
        assert_eq!(client.gen_instance_id("orders"), "svc-1");
    }

    #[test]
    fn test_builder_defaults() {
        let config = RpcregConfigBuilder::default()
            .service_name("orders")
            .registry(
                RegistryConfigBuilder::default()
                    .server_addr("127.0.0.1:8500")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        assert!(config.client.is_none());
        assert_eq!(config.registry.wait_seconds, 30);
        let (min, max) = config.registry.retry_backoff();
        assert_eq!(min, Duration::from_secs(1));
        assert_eq!(max, Duration::from_secs(30));
        assert!(!config.metrics.enable_latency_histograms);
    }
}
