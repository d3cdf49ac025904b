use crate::registrar::HealthRegistrar;
use crate::registry::ServiceInstance;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Start reporting the instance check as passing every `interval`.
///
/// When a pass report is refused the store may have dropped the instance,
/// so it is registered again. Cancel the returned token to stop.
pub fn spawn_heartbeat(
    registrar: HealthRegistrar,
    instance: ServiceInstance,
    interval: Duration,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        log::info!(
            "start heartbeat of instance {} every {:?}",
            instance.id,
            interval
        );
        let mut interval_timer = tokio::time::interval(interval);
        interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval_timer.tick() => {}
            }
            match registrar.report_pass(&instance.id).await {
                Ok(_) => {}
                Err(e) if e.is_unavailable() => {
                    log::error!("heartbeat error: {}", e);
                }
                Err(e) => {
                    log::info!("heartbeat refused ({}), re-register", e);
                    if let Err(e) = registrar.register(&instance).await {
                        log::error!("register error: {}", e);
                        continue;
                    }
                    if let Err(e) = registrar.report_pass(&instance.id).await {
                        log::error!("heartbeat error: {}", e);
                    }
                }
            }
        }
        log::info!("heartbeat of instance {} stopped", instance.id);
    });
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, Registry, ServiceInstanceBuilder};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_makes_instance_discoverable_and_reregisters() {
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
        let cancel = spawn_heartbeat(registrar, instance.clone(), Duration::from_secs(3));

        let first = store
            .lookup_health_service("orders", 1, Duration::from_secs(30))
            .await
            .unwrap();
        let first = if first.instances.is_empty() {
            store
                .lookup_health_service("orders", first.store_index, Duration::from_secs(30))
                .await
                .unwrap()
        } else {
            first
        };
        assert_eq!(first.instances, vec![instance.clone()]);

        // The store forgets the instance; the next beat brings it back.
        store.deregister_service("svc-1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;
        let back = store
            .lookup_health_service("orders", 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(back.instances, vec![instance]);
        cancel.cancel();
    }
}
