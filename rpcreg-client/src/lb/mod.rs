//! # Instance selection
//!
//! Strategies that pick one instance out of the healthy set returned by discovery.
//!
//! ## [`RandomLoadBalance`]
//! Random: Select one randomly from the list of available instances.
//!
//! ## [`RoundRobinLoadBalance`]
//! Round Robin: Select from the instance list in sequential order, per service.
//!
//! # Usage
//! ```rust,ignore
//! let lb = RoundRobinLoadBalance::default();
//! let instance = discovery.get_instance("rpcreg_payments", &lb).await?;
//! ```
mod random;
mod round;

use crate::registry::ServiceInstance;
pub use random::RandomLoadBalance;
pub use round::RoundRobinLoadBalance;

pub trait LoadBalance {
    /// Pick one of `instances`, `None` when the list is empty.
    fn select(&self, service_name: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance>;
}

#[derive(Debug)]
pub enum LoadBalanceError {
    /// Failed to get the instance list
    GetInstancesError(String),
    /// No available instance
    NoAvailableInstance(String),
}

impl std::fmt::Display for LoadBalanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalanceError::GetInstancesError(e) => write!(f, "Failed to get instances: {}", e),
            LoadBalanceError::NoAvailableInstance(s) => {
                write!(f, "No available instance for service: {}", s)
            }
        }
    }
}

impl std::error::Error for LoadBalanceError {}
