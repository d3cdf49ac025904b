use crate::error::RegistryError;
use crate::registry::{Registry, ServiceInstance};
use std::sync::Arc;

/// Registers instances and reports their liveness.
///
/// The registrar does not schedule heartbeats itself, see
/// [`spawn_heartbeat`](crate::heartbeat::spawn_heartbeat). Every failure is
/// returned to the caller, which decides whether to retry.
#[derive(Clone)]
pub struct HealthRegistrar {
    registry: Arc<dyn Registry>,
}

impl HealthRegistrar {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        HealthRegistrar { registry }
    }

    /// Upsert the instance with its TTL check. It becomes discoverable once
    /// the check is reported passing.
    pub async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.registry.register_service(instance).await?;
        log::info!(
            "registered instance {} of {} at {}:{}, ttl {}s",
            instance.id,
            instance.name,
            instance.address,
            instance.port,
            instance.ttl_seconds
        );
        Ok(())
    }

    pub async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.deregister_service(id).await?;
        log::info!("deregistered instance {}", id);
        Ok(())
    }

    pub async fn report_pass(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.check_pass(id).await?;
        log::debug!("check of instance {} passed", id);
        Ok(())
    }

    pub async fn report_fail(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.check_fail(id).await?;
        log::info!("check of instance {} failed", id);
        Ok(())
    }
}

impl std::fmt::Debug for HealthRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistrar").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, ServiceInstanceBuilder};
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = MemoryRegistry::new();
        let registrar = HealthRegistrar::new(Arc::new(store.clone()));
        let instance = ServiceInstanceBuilder::default()
            .id("svc-1")
            .name("orders")
            .address("10.0.0.5")
            .port(9090)
            .ttl_seconds(10)
            .build()
            .unwrap();
        registrar.register(&instance).await.unwrap();
        registrar.register(&instance).await.unwrap();
        registrar.report_pass("svc-1").await.unwrap();

        let result = store
            .lookup_health_service("orders", 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.instances, vec![instance]);

        registrar.deregister("svc-1").await.unwrap();
        let result = store
            .lookup_health_service("orders", result.store_index, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.instances.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        let store = MemoryRegistry::new();
        store.set_available(false);
        let registrar = HealthRegistrar::new(Arc::new(store));
        let err = registrar.report_pass("svc-1").await.unwrap_err();
        assert!(matches!(err, RegistryError::RegistryUnavailable(_)));
        assert!(registrar.deregister("svc-1").await.unwrap_err().is_unavailable());
    }
}
