//! Error taxonomy of the client.
//!
//! Store communication failures are returned to the caller, which owns
//! retry and backoff. Decode failures of a single discovery record or of
//! propagated call metadata are recovered where they happen and only logged.

use thiserror::Error;

/// Errors returned by [`Registry`](crate::registry::Registry) operations.
#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum RegistryError {
    /// The store could not be reached, or timed out, on a registration or point read.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),
    /// The store could not be reached, or timed out, on a blocking lookup.
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(String),
    /// The store answered but refused the request.
    #[error("registry rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RegistryError {
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RegistryError::RegistryUnavailable(_) | RegistryError::DiscoveryUnavailable(_)
        )
    }
}

/// A single raw discovery record that could not be turned into a
/// [`ServiceInstance`](crate::registry::ServiceInstance).
#[derive(Debug, Error)]
pub enum InstanceConversionError {
    #[error("malformed health record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("health record has an empty service id")]
    EmptyId,
    #[error("health record {id} has an invalid port {port}")]
    InvalidPort { id: String, port: u16 },
    #[error("health record {id} has an invalid ttl {value:?}")]
    InvalidTtl { id: String, value: String },
}

/// Propagated call metadata that could not be decoded into a call context.
#[derive(Debug, Error)]
pub enum ContextDecodeError {
    #[error("metadata entry {entry} is not valid base64: {source}")]
    Base64 {
        entry: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("metadata entry {entry} is not a valid map: {source}")]
    Json {
        entry: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid metrics setup, detected when the metrics factory is built at startup.
#[derive(Debug, Error)]
pub enum MetricsConfigurationError {
    #[error("invalid latency buckets: {0}")]
    InvalidBuckets(String),
    #[error("failed to register collector: {0}")]
    Registration(#[from] prometheus::Error),
}
