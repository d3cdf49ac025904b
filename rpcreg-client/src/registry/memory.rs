use crate::error::RegistryError;
use crate::registry::{DiscoveryResult, Registry, ServiceInstance, convert_health_records};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckStatus {
    /// Registered, no heartbeat yet or reported failing
    Critical,
    Passing,
}

#[derive(Debug)]
struct Entry {
    service_name: String,
    /// Health record as the store would return it
    record: Value,
    status: CheckStatus,
    ttl: Duration,
    last_pass: Instant,
}

impl Entry {
    fn is_passing(&self, now: Instant) -> bool {
        self.status == CheckStatus::Passing && self.expires_at().is_none_or(|at| now < at)
    }

    /// When a passing check lapses without a heartbeat; `None` without a ttl.
    fn expires_at(&self) -> Option<Instant> {
        (!self.ttl.is_zero()).then(|| self.last_pass + self.ttl)
    }
}

#[derive(Debug, Default)]
struct State {
    /// instance id -> entry
    entries: HashMap<String, Entry>,
    /// service name -> index of its last modification
    service_index: HashMap<String, u64>,
    /// group -> command payload
    commands: HashMap<String, String>,
    index: u64,
}

impl State {
    fn touch(&mut self, service_name: &str) -> u64 {
        self.index += 1;
        self.service_index
            .insert(service_name.to_string(), self.index);
        self.index
    }

    fn index_of(&self, service_name: &str) -> u64 {
        self.service_index.get(service_name).copied().unwrap_or(1)
    }

    /// Turn lapsed checks critical, moving the index of their services.
    ///
    /// Returns the new store index when anything expired. Runs before any
    /// read so the same index never comes with two different lists.
    fn expire(&mut self, now: Instant) -> Option<u64> {
        let expired = self
            .entries
            .iter_mut()
            .filter(|(_, e)| e.status == CheckStatus::Passing && !e.is_passing(now))
            .map(|(id, e)| {
                e.status = CheckStatus::Critical;
                log::info!("check of instance {} expired", id);
                e.service_name.clone()
            })
            .collect::<Vec<_>>();
        let mut index = None;
        for service_name in expired {
            index = Some(self.touch(&service_name));
        }
        index
    }

    /// Next moment a passing check of `service_name` lapses.
    fn next_expiry(&self, service_name: &str) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| e.service_name == service_name && e.status == CheckStatus::Passing)
            .filter_map(Entry::expires_at)
            .min()
    }

    fn passing_records(&self, service_name: &str, now: Instant) -> Vec<Value> {
        let mut passing = self
            .entries
            .iter()
            .filter(|(_, e)| e.service_name == service_name && e.is_passing(now))
            .collect::<Vec<_>>();
        passing.sort_by(|a, b| a.0.cmp(b.0));
        passing.into_iter().map(|(_, e)| e.record.clone()).collect()
    }
}

/// In-process coordination store.
///
/// Keeps the same contract as a remote store: TTL checks start critical and
/// pass only after a heartbeat, lookups block until the service index moves
/// past the cursor or the wait window elapses. Outages can be simulated with
/// [`MemoryRegistry::set_available`].
#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    state: Arc<Mutex<State>>,
    changes: Arc<watch::Sender<u64>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(1);
        MemoryRegistry {
            state: Arc::new(Mutex::new(State {
                index: 1,
                ..Default::default()
            })),
            changes: Arc::new(changes),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the store going away and coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Store a command for a group, as an operator would.
    pub fn put_command(&self, group: &str, payload: &str) {
        self.lock()
            .commands
            .insert(group.to_string(), payload.to_string());
    }

    /// Current index of a service.
    pub fn service_index(&self, service_name: &str) -> u64 {
        self.lock().index_of(service_name)
    }

    #[cfg(test)]
    pub(crate) fn insert_raw_record(&self, id: &str, service_name: &str, record: Value) {
        let mut state = self.lock();
        state.entries.insert(
            id.to_string(),
            Entry {
                service_name: service_name.to_string(),
                record,
                status: CheckStatus::Passing,
                ttl: Duration::ZERO,
                last_pass: Instant::now(),
            },
        );
        let index = state.touch(service_name);
        drop(state);
        self.changes.send_replace(index);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_available(&self, unavailable: fn(String) -> RegistryError) -> Result<(), RegistryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(unavailable("memory store is down".to_string()))
        }
    }

    fn set_status(&self, instance_id: &str, status: CheckStatus) -> Result<(), RegistryError> {
        self.ensure_available(RegistryError::RegistryUnavailable)?;
        let now = Instant::now();
        let mut state = self.lock();
        let expired = state.expire(now);
        let Some(entry) = state.entries.get_mut(instance_id) else {
            drop(state);
            self.publish(expired);
            return Err(RegistryError::Rejected {
                status: 404,
                message: format!("no check found for instance {}", instance_id),
            });
        };
        let was_passing = entry.is_passing(now);
        entry.status = status;
        if status == CheckStatus::Passing {
            entry.last_pass = now;
        }
        let service_name = entry.service_name.clone();
        // A heartbeat on an already passing check does not change what lookups return.
        let index = if was_passing == (status == CheckStatus::Passing) {
            expired
        } else {
            Some(state.touch(&service_name))
        };
        drop(state);
        self.publish(index);
        Ok(())
    }

    fn publish(&self, index: Option<u64>) {
        if let Some(index) = index {
            self.changes.send_replace(index);
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register_service(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.ensure_available(RegistryError::RegistryUnavailable)?;
        let mut state = self.lock();
        let previous = state.entries.insert(
            instance.id.clone(),
            Entry {
                service_name: instance.name.clone(),
                record: instance.to_health_record(),
                status: CheckStatus::Critical,
                ttl: Duration::from_secs(instance.ttl_seconds),
                last_pass: Instant::now(),
            },
        );
        let mut index = state.touch(&instance.name);
        // Re-registration under another name removes it from the old service.
        if let Some(previous) = previous.filter(|p| p.service_name != instance.name) {
            index = state.touch(&previous.service_name);
        }
        drop(state);
        self.changes.send_replace(index);
        Ok(())
    }

    async fn deregister_service(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.ensure_available(RegistryError::RegistryUnavailable)?;
        let mut state = self.lock();
        let Some(entry) = state.entries.remove(instance_id) else {
            return Ok(());
        };
        let index = state.touch(&entry.service_name);
        drop(state);
        self.changes.send_replace(index);
        Ok(())
    }

    async fn check_pass(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.set_status(instance_id, CheckStatus::Passing)
    }

    async fn check_fail(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.set_status(instance_id, CheckStatus::Critical)
    }

    async fn lookup_health_service(
        &self,
        service_name: &str,
        since_index: u64,
        wait: Duration,
    ) -> Result<DiscoveryResult, RegistryError> {
        self.ensure_available(RegistryError::DiscoveryUnavailable)?;
        let deadline = Instant::now() + wait;
        let mut changes = self.changes.subscribe();
        loop {
            let now = Instant::now();
            let (index, records, next_expiry) = {
                let mut state = self.lock();
                let expired = state.expire(now);
                self.publish(expired);
                (
                    state.index_of(service_name),
                    state.passing_records(service_name, now),
                    state.next_expiry(service_name),
                )
            };
            if since_index == 0 || index > since_index || Instant::now() >= deadline {
                return Ok(DiscoveryResult {
                    instances: convert_health_records(&records),
                    store_index: index,
                    last_contact_millis: 0,
                    known_leader: true,
                });
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(RegistryError::DiscoveryUnavailable("memory store closed".to_string()));
                    }
                }
                _ = tokio::time::sleep_until(next_expiry.map_or(deadline, |at| at.min(deadline))) => {}
            }
            self.ensure_available(RegistryError::DiscoveryUnavailable)?;
        }
    }

    async fn lookup_command(&self, group: &str) -> Result<String, RegistryError> {
        self.ensure_available(RegistryError::RegistryUnavailable)?;
        Ok(self.lock().commands.get(group).cloned().unwrap_or_default())
    }
}
