use crate::lb::LoadBalance;
use crate::registry::ServiceInstance;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct RoundRobinLoadBalance {
    index: DashMap<String, usize>,
}

impl RoundRobinLoadBalance {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RoundRobinLoadBalance {
    fn select(&self, service_name: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        if instances.len() == 1 {
            return Some(instances[0].clone());
        }
        let mut index = self.index.entry(service_name.to_string()).or_insert(0);
        *index = (*index + 1) % instances.len();
        Some(instances[*index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceInstanceBuilder;

    #[test]
    fn test_round_robin_balance() {
        let lb = RoundRobinLoadBalance::new();
        let instances = (0..3u16)
            .map(|i| {
                ServiceInstanceBuilder::default()
                    .id(format!("svc-{}", i))
                    .name("orders")
                    .address("10.0.0.5")
                    .port(9000 + i)
                    .build()
                    .unwrap()
            })
            .collect::<Vec<_>>();
        let picked = (0..6)
            .map(|_| lb.select("orders", &instances).unwrap().id)
            .collect::<Vec<_>>();
        assert_eq!(
            picked,
            vec!["svc-1", "svc-2", "svc-0", "svc-1", "svc-2", "svc-0"]
        );
        // Cursors are kept per service.
        assert_eq!(lb.select("payments", &instances).unwrap().id, "svc-1");
    }
}
