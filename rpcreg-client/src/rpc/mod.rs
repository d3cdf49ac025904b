//! # Transport boundary
//!
//! The pieces of an RPC call the interceptors need, independent of the transport:
//! the metadata map, the shape and name of the called method, and the
//! terminal status of the call.

mod interceptor;

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

pub use interceptor::{
    CallHandle, ClientInterceptor, ContextClientInterceptor, ContextServerInterceptor,
    ServerInterceptor,
};

/// Call metadata as a string map. Keys are case-insensitive and stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into().to_ascii_lowercase(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

impl From<HashMap<String, String>> for Metadata {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// Shape of a call, a metrics label dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Unary => "UNARY",
            CallKind::ClientStreaming => "CLIENT_STREAMING",
            CallKind::ServerStreaming => "SERVER_STREAMING",
            CallKind::BidiStreaming => "BIDI_STREAMING",
        }
    }

    /// The client sends a stream of request messages.
    pub fn streams_requests(&self) -> bool {
        matches!(self, CallKind::ClientStreaming | CallKind::BidiStreaming)
    }

    /// The server sends a stream of response messages.
    pub fn streams_responses(&self) -> bool {
        matches!(self, CallKind::ServerStreaming | CallKind::BidiStreaming)
    }
}

/// A called method: kind, fully qualified service name and method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub kind: CallKind,
    pub service: String,
    pub method: String,
}

impl MethodDescriptor {
    pub fn new(kind: CallKind, service: impl Into<String>, method: impl Into<String>) -> Self {
        MethodDescriptor {
            kind,
            service: service.into(),
            method: method.into(),
        }
    }

    /// Parse a full method name such as `orders.Orders/Get`.
    pub fn from_full_name(kind: CallKind, full_name: &str) -> Option<Self> {
        let (service, method) = full_name.trim_start_matches('/').rsplit_once('/')?;
        if service.is_empty() || method.is_empty() {
            return None;
        }
        Some(Self::new(kind, service, method))
    }
}

/// Terminal status code of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

/// Status code a call result completes with.
pub(crate) fn code_of<T>(result: &Result<T, Status>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::Ok,
        Err(status) => status.code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_keys_are_case_insensitive() {
        let mut metadata = Metadata::new();
        metadata.insert("X-Tenant", "acme");
        assert_eq!(metadata.get("x-tenant"), Some("acme"));
        assert_eq!(metadata.remove("X-TENANT"), Some("acme".to_string()));
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_method_from_full_name() {
        let method = MethodDescriptor::from_full_name(CallKind::Unary, "/orders.Orders/Get").unwrap();
        assert_eq!(method.service, "orders.Orders");
        assert_eq!(method.method, "Get");
        assert!(MethodDescriptor::from_full_name(CallKind::Unary, "Get").is_none());
        assert!(MethodDescriptor::from_full_name(CallKind::Unary, "orders.Orders/").is_none());
    }

    #[test]
    fn test_call_kind_streaming_directions() {
        assert!(!CallKind::Unary.streams_requests());
        assert!(!CallKind::Unary.streams_responses());
        assert!(CallKind::ClientStreaming.streams_requests());
        assert!(CallKind::ServerStreaming.streams_responses());
        assert!(CallKind::BidiStreaming.streams_requests() && CallKind::BidiStreaming.streams_responses());
        assert_eq!(StatusCode::DeadlineExceeded.to_string(), "DEADLINE_EXCEEDED");
    }
}
