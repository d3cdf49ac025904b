use crate::lb::LoadBalance;
use crate::registry::ServiceInstance;

#[derive(Debug, Default)]
pub struct RandomLoadBalance;

impl RandomLoadBalance {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RandomLoadBalance {
    fn select(&self, _service_name: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        match instances.len() {
            0 => None,
            1 => Some(instances[0].clone()),
            n => Some(instances[fastrand::usize(0..n)].clone()),
        }
    }
}
