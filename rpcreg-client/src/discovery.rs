//! # Service discovery
//!
//! [`DiscoveryWatcher::lookup`] is one blocking round of the index based
//! long-poll protocol. Continuous discovery is built from it the only correct
//! way: start with index 0, remember the returned `store_index`, and call
//! `lookup` again immediately, one loop per service name:
//!
//! ```rust,ignore
//! let mut index = 0;
//! loop {
//!     match watcher.lookup("orders", index).await {
//!         Ok(result) => {
//!             index = result.store_index;
//!             // use result.instances
//!         }
//!         Err(e) => {
//!             // back off before retrying with the same index
//!             tokio::time::sleep(backoff).await;
//!         }
//!     }
//! }
//! ```
//!
//! [`Discovery`] runs exactly that loop for every watched service and keeps
//! the latest instance list of each.
//!
//! The index returned by `lookup` never goes below the one passed in. After a
//! store restart resets its index, a caller feeding that clamped index back
//! waits out the full window on every round until the store catches up. The
//! watch loops of [`Discovery`] follow the store's own index instead.

use crate::conf::RegistryConfig;
use crate::error::RegistryError;
use crate::lb::{LoadBalance, LoadBalanceError};
use crate::registry::{DiscoveryResult, Registry, ServiceInstance};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Latest instance list of a watched service, `None` until the first round completes.
pub type InstancesReceiver = watch::Receiver<Option<Arc<Vec<ServiceInstance>>>>;

/// Blocking lookups of healthy instances.
#[derive(Clone)]
pub struct DiscoveryWatcher {
    registry: Arc<dyn Registry>,
    /// Server-side wait window of one round
    wait: Duration,
}

impl DiscoveryWatcher {
    pub fn new(registry: Arc<dyn Registry>, wait: Duration) -> Self {
        DiscoveryWatcher { registry, wait }
    }

    /// One long-poll round for `service_name`.
    ///
    /// Returns when the store state moved past `since_index` or when the wait
    /// window elapsed (same index, same instances). An empty instance list is
    /// a valid result. The returned index never goes below `since_index`.
    pub async fn lookup(
        &self,
        service_name: &str,
        since_index: u64,
    ) -> Result<DiscoveryResult, RegistryError> {
        let mut result = self.lookup_unclamped(service_name, since_index).await?;
        result.store_index = result.store_index.max(since_index);
        Ok(result)
    }

    /// One round carrying the index the store reported, even a lower one.
    async fn lookup_unclamped(
        &self,
        service_name: &str,
        since_index: u64,
    ) -> Result<DiscoveryResult, RegistryError> {
        let result = self
            .registry
            .lookup_health_service(service_name, since_index, self.wait)
            .await?;
        if result.store_index < since_index {
            log::warn!(
                "store index of {} went backwards ({} -> {}), store restarted?",
                service_name,
                since_index,
                result.store_index
            );
        }
        Ok(result)
    }
}

impl std::fmt::Debug for DiscoveryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryWatcher")
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct WatchEntry {
    instances: InstancesReceiver,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct WatchPolicy {
    backoff_min: Duration,
    backoff_max: Duration,
    keep_last_on_empty: bool,
}

/// Cache of healthy instances kept current by one watch loop per service.
#[derive(Debug)]
pub struct Discovery {
    watcher: DiscoveryWatcher,
    services: DashMap<String, WatchEntry>,
    policy: WatchPolicy,
    shutdown: CancellationToken,
}

impl Discovery {
    pub fn new(registry: Arc<dyn Registry>, config: &RegistryConfig) -> Self {
        let (backoff_min, backoff_max) = config.retry_backoff();
        Discovery {
            watcher: DiscoveryWatcher::new(registry, config.wait()),
            services: DashMap::new(),
            policy: WatchPolicy {
                backoff_min,
                backoff_max,
                keep_last_on_empty: config.keep_last_on_empty,
            },
            shutdown: CancellationToken::new(),
        }
    }

    pub fn watcher(&self) -> &DiscoveryWatcher {
        &self.watcher
    }

    /// Start watching a service unless it is already watched.
    pub fn watch(&self, service_name: &str) -> InstancesReceiver {
        self.services
            .entry(service_name.to_string())
            .or_insert_with(|| {
                let (sender, instances) = watch::channel(None);
                let cancel = self.shutdown.child_token();
                tokio::spawn(run_watch_loop(
                    self.watcher.clone(),
                    service_name.to_string(),
                    sender,
                    cancel.clone(),
                    self.policy,
                ));
                WatchEntry { instances, cancel }
            })
            .instances
            .clone()
    }

    /// Change notifications for a service, watching it if needed.
    pub fn subscribe(&self, service_name: &str) -> InstancesReceiver {
        self.watch(service_name)
    }

    /// Stop watching a service. The in-flight lookup is aborted.
    pub fn unwatch(&self, service_name: &str) {
        if let Some((_, entry)) = self.services.remove(service_name) {
            entry.cancel.cancel();
            log::info!("stop watching service {}", service_name);
        }
    }

    pub fn watched_services(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Healthy instances of a service.
    ///
    /// Served from the cache once the watch loop completed a round, otherwise
    /// fetched directly.
    pub async fn get_instances(
        &self,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>, RegistryError> {
        let receiver = self.watch(service_name);
        let cached = receiver.borrow().clone();
        match cached {
            Some(instances) => Ok(instances.as_ref().clone()),
            None => Ok(self.watcher.lookup(service_name, 0).await?.instances),
        }
    }

    /// Pick one healthy instance with the given strategy.
    pub async fn get_instance(
        &self,
        service_name: &str,
        lb: &impl LoadBalance,
    ) -> Result<ServiceInstance, LoadBalanceError> {
        let instances = self
            .get_instances(service_name)
            .await
            .map_err(|e| LoadBalanceError::GetInstancesError(e.to_string()))?;
        lb.select(service_name, &instances)
            .ok_or_else(|| LoadBalanceError::NoAvailableInstance(service_name.to_string()))
    }

    /// Stop every watch loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.services.clear();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_watch_loop(
    watcher: DiscoveryWatcher,
    service_name: String,
    sender: watch::Sender<Option<Arc<Vec<ServiceInstance>>>>,
    cancel: CancellationToken,
    policy: WatchPolicy,
) {
    log::info!("start watching service {}", service_name);
    let mut index = 0;
    let mut backoff = policy.backoff_min;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = watcher.lookup_unclamped(&service_name, index) => result,
        };
        let result = match result {
            Ok(result) => {
                index = result.store_index;
                result
            }
            Err(e) => {
                log::error!(
                    "lookup service {} failed, retry in {:?}: {}",
                    service_name,
                    backoff,
                    e
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(policy.backoff_max);
                continue;
            }
        };
        backoff = policy.backoff_min;

        let current = sender.borrow().clone();
        if current.as_deref() == Some(&result.instances) {
            continue;
        }
        if result.instances.is_empty()
            && policy.keep_last_on_empty
            && current.as_ref().is_some_and(|c| !c.is_empty())
        {
            log::warn!(
                "lookup of service {} returned no instances, keeping the last {}",
                service_name,
                current.as_ref().map(|c| c.len()).unwrap_or_default()
            );
            continue;
        }
        log::info!(
            "instances of service {} changed, index {}, count {}",
            service_name,
            index,
            result.instances.len()
        );
        sender.send_replace(Some(Arc::new(result.instances)));
    }
    log::info!("watch loop of service {} stopped", service_name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::RegistryConfigBuilder;
    use crate::lb::RoundRobinLoadBalance;
    use crate::registry::{MemoryRegistry, ServiceInstanceBuilder};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn instance(id: &str, port: u16) -> ServiceInstance {
        ServiceInstanceBuilder::default()
            .id(id)
            .name("orders")
            .address("10.0.0.5")
            .port(port)
            .ttl_seconds(10)
            .build()
            .unwrap()
    }

    fn config(keep_last_on_empty: bool) -> RegistryConfig {
        RegistryConfigBuilder::default()
            .wait_seconds(30)
            .retry_backoff_min_millis(1000)
            .retry_backoff_max_millis(4000)
            .keep_last_on_empty(keep_last_on_empty)
            .build()
            .unwrap()
    }

    async fn next_change(receiver: &mut InstancesReceiver) -> Vec<ServiceInstance> {
        receiver.changed().await.unwrap();
        receiver
            .borrow_and_update()
            .as_deref()
            .cloned()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_register_then_heartbeat_scenario() {
        let store = MemoryRegistry::new();
        let watcher = DiscoveryWatcher::new(Arc::new(store.clone()), Duration::from_secs(30));
        let svc = instance("svc-1", 9090);
        store.register_service(&svc).await.unwrap();

        let before = watcher.lookup("orders", 0).await.unwrap();
        assert!(before.instances.is_empty());

        let pending = {
            let watcher = watcher.clone();
            let index = before.store_index;
            tokio::spawn(async move { watcher.lookup("orders", index).await })
        };
        store.check_pass("svc-1").await.unwrap();
        let after = pending.await.unwrap().unwrap();
        assert_eq!(after.instances, vec![svc.clone()]);

        let first = watcher.lookup("orders", 0).await.unwrap();
        assert_eq!(first.instances, vec![svc]);
    }

    #[tokio::test]
    async fn test_store_index_is_non_decreasing() {
        let store = MemoryRegistry::new();
        let watcher = DiscoveryWatcher::new(Arc::new(store.clone()), Duration::from_secs(1));
        let mut index = 0;
        let mut seen = vec![];
        for i in 0..5u16 {
            let svc = instance(&format!("svc-{}", i), 9000 + i);
            store.register_service(&svc).await.unwrap();
            store.check_pass(&svc.id).await.unwrap();
            if i % 2 == 0 {
                store.check_fail(&svc.id).await.unwrap();
            }
            let result = watcher.lookup("orders", index).await.unwrap();
            index = result.store_index;
            seen.push(index);
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    /// A store whose index went back after a restart.
    struct ResetStore;

    #[async_trait]
    impl Registry for ResetStore {
        async fn register_service(&self, _: &ServiceInstance) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn deregister_service(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn check_pass(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn check_fail(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn lookup_health_service(
            &self,
            _: &str,
            _: u64,
            _: Duration,
        ) -> Result<DiscoveryResult, RegistryError> {
            Ok(DiscoveryResult {
                instances: vec![],
                store_index: 5,
                last_contact_millis: 0,
                known_leader: true,
            })
        }
        async fn lookup_command(&self, _: &str) -> Result<String, RegistryError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_index_reset_is_clamped() {
        let watcher = DiscoveryWatcher::new(Arc::new(ResetStore), Duration::from_secs(1));
        assert_eq!(watcher.lookup("orders", 0).await.unwrap().store_index, 5);
        assert_eq!(watcher.lookup("orders", 42).await.unwrap().store_index, 42);
    }

    /// Reports index 100 once, then restarts with index 5 and blocks on it.
    #[derive(Default)]
    struct RestartedStore {
        cursors: std::sync::Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Registry for RestartedStore {
        async fn register_service(&self, _: &ServiceInstance) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn deregister_service(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn check_pass(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn check_fail(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn lookup_health_service(
            &self,
            _: &str,
            since_index: u64,
            wait: Duration,
        ) -> Result<DiscoveryResult, RegistryError> {
            let store_index = {
                let mut cursors = self.cursors.lock().unwrap();
                cursors.push(since_index);
                if cursors.len() == 1 { 100 } else { 5 }
            };
            if since_index == store_index {
                tokio::time::sleep(wait).await;
            }
            Ok(DiscoveryResult {
                instances: vec![],
                store_index,
                last_contact_millis: 0,
                known_leader: true,
            })
        }
        async fn lookup_command(&self, _: &str) -> Result<String, RegistryError> {
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_follows_restarted_store_index() {
        let store = Arc::new(RestartedStore::default());
        let discovery = Discovery::new(store.clone(), &config(true));
        let _receiver = discovery.watch("orders");
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Blocks on the store's new index instead of the stale 100.
        assert_eq!(*store.cursors.lock().unwrap(), vec![0, 100, 5]);
        discovery.shutdown();
    }

    #[tokio::test]
    async fn test_watch_publishes_changes() {
        let store = MemoryRegistry::new();
        let discovery = Discovery::new(Arc::new(store.clone()), &config(false));
        let mut receiver = discovery.watch("orders");

        assert!(next_change(&mut receiver).await.is_empty());

        let svc = instance("svc-1", 9090);
        store.register_service(&svc).await.unwrap();
        store.check_pass("svc-1").await.unwrap();
        assert_eq!(next_change(&mut receiver).await, vec![svc.clone()]);
        assert_eq!(discovery.get_instances("orders").await.unwrap(), vec![svc]);

        store.deregister_service("svc-1").await.unwrap();
        assert!(next_change(&mut receiver).await.is_empty());
        discovery.shutdown();
    }

    #[tokio::test]
    async fn test_watch_keeps_last_on_empty() {
        let store = MemoryRegistry::new();
        let svc = instance("svc-1", 9090);
        store.register_service(&svc).await.unwrap();
        store.check_pass("svc-1").await.unwrap();

        let discovery = Discovery::new(Arc::new(store.clone()), &config(true));
        let mut receiver = discovery.watch("orders");
        assert_eq!(next_change(&mut receiver).await, vec![svc.clone()]);

        store.check_fail("svc-1").await.unwrap();
        let other = instance("svc-2", 9091);
        store.register_service(&other).await.unwrap();
        store.check_pass("svc-2").await.unwrap();
        // The empty round in between never reaches subscribers.
        assert_eq!(next_change(&mut receiver).await, vec![other]);
        discovery.shutdown();
    }

    #[tokio::test]
    async fn test_get_instance_with_lb() {
        let store = MemoryRegistry::new();
        for (id, port) in [("svc-1", 9090), ("svc-2", 9091)] {
            store.register_service(&instance(id, port)).await.unwrap();
            store.check_pass(id).await.unwrap();
        }
        let discovery = Discovery::new(Arc::new(store), &config(true));
        let lb = RoundRobinLoadBalance::default();
        let a = discovery.get_instance("orders", &lb).await.unwrap();
        let b = discovery.get_instance("orders", &lb).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(matches!(
            discovery.get_instance("payments", &lb).await,
            Err(LoadBalanceError::NoAvailableInstance(_))
        ));
    }

    /// Always unreachable, counts calls.
    struct DownStore {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Registry for DownStore {
        async fn register_service(&self, _: &ServiceInstance) -> Result<(), RegistryError> {
            Err(RegistryError::RegistryUnavailable("down".into()))
        }
        async fn deregister_service(&self, _: &str) -> Result<(), RegistryError> {
            Err(RegistryError::RegistryUnavailable("down".into()))
        }
        async fn check_pass(&self, _: &str) -> Result<(), RegistryError> {
            Err(RegistryError::RegistryUnavailable("down".into()))
        }
        async fn check_fail(&self, _: &str) -> Result<(), RegistryError> {
            Err(RegistryError::RegistryUnavailable("down".into()))
        }
        async fn lookup_health_service(
            &self,
            _: &str,
            _: u64,
            _: Duration,
        ) -> Result<DiscoveryResult, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RegistryError::DiscoveryUnavailable("down".into()))
        }
        async fn lookup_command(&self, _: &str) -> Result<String, RegistryError> {
            Err(RegistryError::RegistryUnavailable("down".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_backs_off_on_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let discovery = Discovery::new(
            Arc::new(DownStore {
                calls: calls.clone(),
            }),
            &config(true),
        );
        let _receiver = discovery.watch("orders");
        tokio::time::sleep(Duration::from_secs(10)).await;
        // 0s, 1s, 3s, 7s: 1s doubling, capped at 4s
        let n = calls.load(Ordering::SeqCst);
        assert!((3..=5).contains(&n), "unexpected call count {}", n);
        discovery.shutdown();
    }

    /// Lookup never returns; records when the pending request is dropped.
    struct HangingStore {
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Registry for HangingStore {
        async fn register_service(&self, _: &ServiceInstance) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn deregister_service(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn check_pass(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn check_fail(&self, _: &str) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn lookup_health_service(
            &self,
            _: &str,
            _: u64,
            _: Duration,
        ) -> Result<DiscoveryResult, RegistryError> {
            let _flag = DropFlag(self.dropped.clone());
            std::future::pending::<()>().await;
            unreachable!()
        }
        async fn lookup_command(&self, _: &str) -> Result<String, RegistryError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_unwatch_aborts_pending_lookup() {
        let dropped = Arc::new(AtomicBool::new(false));
        let discovery = Discovery::new(
            Arc::new(HangingStore {
                dropped: dropped.clone(),
            }),
            &config(true),
        );
        let _receiver = discovery.watch("orders");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!dropped.load(Ordering::SeqCst));

        discovery.unwatch("orders");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dropped.load(Ordering::SeqCst));
        assert!(discovery.watched_services().is_empty());
    }
}
