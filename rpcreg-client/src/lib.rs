//! # Rpcreg Client
//!
//! rpcreg-client is the coordination layer of an RPC framework. It registers service
//! instances with a TTL health check in a coordination store (Consul-style HTTP API),
//! keeps discovered instance lists current with index based long polling, reads
//! operator-pushed commands, propagates a call context across calls and records
//! Prometheus call metrics.
//!
//! # Quick Start
//!
//! Add a `bootstrap.yaml` configuration file in your project's root directory:
//!
//! ```yaml
//! rpcreg:
//!   # Logical service name this process registers under
//!   service-name: orders
//!   # Instance registered for this process, omit to only discover
//!   client:
//!     address: 10.0.0.5
//!     port: 9090
//!     ttl-seconds: 10
//!     heartbeat-interval-seconds: 3
//!   # Coordination store
//!   registry:
//!     server-addr:
//!       - 127.0.0.1:8500
//!       - 127.0.0.1:8501
//!     wait-seconds: 30
//!   metrics:
//!     enable-latency-histograms: true
//!   references:
//!     - group: payments
//!       call-type: future
//! ```
//!
//! Then, initialize in the `main` function:
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() {
//!     init().await;
//!     // Healthy instances of a service
//!     let instances = AppDiscovery::get_instances("rpcreg_payments").await.unwrap();
//!     println!("service instances: {:?}", instances);
//!     // Current command of a group
//!     let command = AppCommand::fetch("payments").await.unwrap();
//!     println!("command: {}", command.payload);
//! }
//! ```
//!
//! # Initialize from custom configuration
//!
//! ```rust,ignore
//! let config = RpcregConfigBuilder::default()
//!     .service_name("orders")
//!     .client(ClientConfigBuilder::default().address("10.0.0.5").port(9090).build().unwrap())
//!     .registry(RegistryConfigBuilder::default().server_addr("127.0.0.1:8500").build().unwrap())
//!     .build()
//!     .unwrap();
//! init_with(config).await;
//! ```
//!
//! # Call context
//!
//! Values put into the [`CallContext`] of a call travel to the callee through
//! the interceptors:
//!
//! ```rust,ignore
//! let mut context = CallContext::new();
//! context.set_attachment("tenant", "acme");
//! let client = rpcreg.client_interceptor(&reference);
//! context.scope(client.call(&method, |metadata, _| transport.send(metadata, request))).await;
//! ```

use crate::conf::{ReferenceConfig, RpcregConfig, RpcregConfigWrapper};
use crate::registry::{HttpRegistry, Registry, ServiceInstance, ServiceInstanceBuilder};
use anyhow::bail;
use prometheus::{Encoder, TextEncoder};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::exit;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod command;
pub mod conf;
mod context;
mod discovery;
mod error;
mod heartbeat;
pub mod lb;
mod metrics;
mod network;
mod registrar;
pub mod registry;
pub mod rpc;
mod utils;

pub use command::CommandChannel;
pub use context::{ATTACHMENTS_KEY, CallContext, VALUES_KEY};
pub use discovery::{Discovery, DiscoveryWatcher, InstancesReceiver};
pub use error::{
    ContextDecodeError, InstanceConversionError, MetricsConfigurationError, RegistryError,
};
pub use heartbeat::spawn_heartbeat;
pub use metrics::{CallMonitor, MessageRecorder, MethodMetrics, MetricsFactory, Side};
pub use registrar::HealthRegistrar;
pub use registry::{Command, DiscoveryResult};

/// Process-wide instance set up by [`init`], [`init_from_file`] or [`init_with`].
static RPCREG: OnceLock<Rpcreg> = OnceLock::new();

/// The components of one process, built from an [`RpcregConfig`].
pub struct Rpcreg {
    config: RpcregConfig,
    registry: Arc<dyn Registry>,
    registrar: HealthRegistrar,
    discovery: Arc<Discovery>,
    commands: CommandChannel,
    metrics_registry: prometheus::Registry,
    server_metrics: Arc<MetricsFactory>,
    client_metrics: Arc<MetricsFactory>,
    instance: Option<ServiceInstance>,
    heartbeat: Option<CancellationToken>,
}

impl Rpcreg {
    fn load(file: Option<PathBuf>) -> anyhow::Result<RpcregConfig> {
        let mut file = file.unwrap_or("bootstrap.yaml".into());
        if !file.exists() {
            file = "bootstrap.yml".into();
        }
        let s = std::fs::read_to_string(&file)
            .map_err(|e| anyhow::anyhow!("no bootstrap.yaml found, {}", e))?;
        log::info!("loaded bootstrap config from {}", file.display());
        let config = serde_yaml::from_str::<RpcregConfigWrapper>(&s)
            .map_err(|e| anyhow::anyhow!("parse bootstrap.yaml failed, {}", e))?;
        Ok(config.rpcreg)
    }

    /// Build every component against the store named in the configuration.
    pub async fn try_init_with(config: RpcregConfig) -> anyhow::Result<Self> {
        let registry = HttpRegistry::new(&config.registry)?;
        Self::try_init_with_registry(config, Arc::new(registry)).await
    }

    /// Build every component against the given store backend.
    ///
    /// When the configuration has a `client` section, the instance is
    /// registered and its heartbeat started.
    pub async fn try_init_with_registry(
        config: RpcregConfig,
        registry: Arc<dyn Registry>,
    ) -> anyhow::Result<Self> {
        #[cfg(feature = "logger")]
        utils::init_log();

        let metrics_registry = prometheus::Registry::new();
        let server_metrics = Arc::new(MetricsFactory::new(
            Side::Server,
            &config.metrics,
            &metrics_registry,
        )?);
        let client_metrics = Arc::new(MetricsFactory::new(
            Side::Client,
            &config.metrics,
            &metrics_registry,
        )?);

        let registrar = HealthRegistrar::new(registry.clone());
        let discovery = Arc::new(Discovery::new(registry.clone(), &config.registry));
        let commands = CommandChannel::new(registry.clone());

        let mut instance = None;
        let mut heartbeat = None;
        if let Some(client) = &config.client {
            let registered = ServiceInstanceBuilder::default()
                .id(client.gen_instance_id(&config.service_name))
                .name(config.service_name.clone())
                .address(client.address.clone())
                .port(client.port)
                .tags(client.tags.iter().cloned().collect::<BTreeSet<_>>())
                .ttl_seconds(client.ttl_seconds)
                .build()?;
            registrar.register(&registered).await?;
            if client.heartbeat_interval_seconds > 0 {
                heartbeat = Some(spawn_heartbeat(
                    registrar.clone(),
                    registered.clone(),
                    Duration::from_secs(client.heartbeat_interval_seconds),
                ));
            } else {
                registrar.report_pass(&registered.id).await?;
            }
            instance = Some(registered);
        }

        for reference in &config.references {
            discovery.watch(&reference.service_name());
        }

        log::info!("rpcreg init completed");
        Ok(Rpcreg {
            config,
            registry,
            registrar,
            discovery,
            commands,
            metrics_registry,
            server_metrics,
            client_metrics,
            instance,
            heartbeat,
        })
    }

    /// The process-wide instance, once initialized.
    pub fn global() -> Option<&'static Rpcreg> {
        RPCREG.get()
    }

    pub fn config(&self) -> &RpcregConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<dyn Registry> {
        self.registry.clone()
    }

    pub fn registrar(&self) -> &HealthRegistrar {
        &self.registrar
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    /// The instance registered for this process, if any.
    pub fn instance(&self) -> Option<&ServiceInstance> {
        self.instance.as_ref()
    }

    /// Interceptor chain for incoming calls.
    pub fn server_interceptor(&self) -> rpc::ServerInterceptor {
        rpc::ServerInterceptor::new(self.server_metrics.clone())
    }

    /// Interceptor chain for calls through `reference`.
    pub fn client_interceptor(&self, reference: &ReferenceConfig) -> rpc::ClientInterceptor {
        rpc::ClientInterceptor::new(reference.clone(), self.client_metrics.clone())
    }

    /// Interceptor chain of a configured reference.
    pub fn reference(&self, group: &str) -> Option<rpc::ClientInterceptor> {
        self.config
            .references
            .iter()
            .find(|r| r.group == group)
            .map(|r| self.client_interceptor(r))
    }

    pub fn metrics_registry(&self) -> &prometheus::Registry {
        &self.metrics_registry
    }

    /// Current metrics in the Prometheus text exposition format.
    pub fn gather_metrics(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.metrics_registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Stop the heartbeat and every watch, then deregister the instance.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.cancel();
        }
        self.discovery.shutdown();
        if let Some(instance) = &self.instance {
            self.registrar.deregister(&instance.id).await?;
        }
        log::info!("rpcreg shutdown completed");
        Ok(())
    }
}

impl std::fmt::Debug for Rpcreg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpcreg")
            .field("service_name", &self.config.service_name)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

async fn init_global(config: anyhow::Result<RpcregConfig>) -> anyhow::Result<()> {
    if RPCREG.get().is_some() {
        bail!("rpcreg has already been initialized, please do not initialize repeatedly");
    }
    let rpcreg = Rpcreg::try_init_with(config?).await?;
    if let Err(rpcreg) = RPCREG.set(rpcreg) {
        rpcreg.shutdown().await?;
        bail!("rpcreg has already been initialized, please do not initialize repeatedly");
    }
    Ok(())
}

/// Initialize from `bootstrap.yaml` (or `bootstrap.yml`) in the working directory
pub async fn init() {
    if let Err(e) = init_global(Rpcreg::load(None)).await {
        log::error!("rpcreg init failed: {}", e);
        exit(1);
    }
}

/// Initialize from configuration file
pub async fn init_from_file(path: impl Into<PathBuf>) {
    if let Err(e) = init_global(Rpcreg::load(Some(path.into()))).await {
        log::error!("rpcreg init failed: {}", e);
        exit(1);
    }
}

/// Initialize from custom configuration
pub async fn init_with(config: RpcregConfig) {
    if let Err(e) = init_global(Ok(config)).await {
        log::error!("rpcreg init failed: {}", e);
        exit(1);
    }
}

/// Shut the process-wide instance down, see [`Rpcreg::shutdown`].
pub async fn shutdown() -> anyhow::Result<()> {
    match RPCREG.get() {
        Some(rpcreg) => rpcreg.shutdown().await,
        None => bail!("rpcreg not initialized"),
    }
}

fn global() -> anyhow::Result<&'static Rpcreg> {
    match RPCREG.get() {
        Some(rpcreg) => Ok(rpcreg),
        None => bail!("rpcreg not initialized"),
    }
}

/// Service Discovery
pub struct AppDiscovery;
impl AppDiscovery {
    /// Get healthy instances of the specified service
    pub async fn get_instances(service_name: &str) -> anyhow::Result<Vec<ServiceInstance>> {
        Ok(global()?.discovery.get_instances(service_name).await?)
    }

    /// Follow the instance list of the specified service
    pub fn watch(service_name: &str) -> anyhow::Result<InstancesReceiver> {
        Ok(global()?.discovery.watch(service_name))
    }
}

/// Dynamic commands
pub struct AppCommand;
impl AppCommand {
    /// Current command of a group, empty when none is stored
    pub async fn fetch(group: &str) -> anyhow::Result<Command> {
        Ok(global()?.commands.fetch_command(group).await?)
    }
}
