//! # Call context
//!
//! Attachments (string to string) and values (string to any JSON value) that
//! travel with a call. Inside a call the context is bound to the task handling
//! it, see [`CallContext::scope`]. On the wire it is carried by two metadata
//! entries holding base64 encoded JSON objects.
use crate::error::ContextDecodeError;
use crate::rpc::Metadata;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;

/// Metadata entry carrying the attachments.
pub const ATTACHMENTS_KEY: &str = "x-rpc-attachments";
/// Metadata entry carrying the values.
pub const VALUES_KEY: &str = "x-rpc-values";

tokio::task_local! {
    static CURRENT: RefCell<CallContext>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallContext {
    attachments: HashMap<String, String>,
    values: HashMap<String, Value>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty() && self.values.is_empty()
    }

    pub fn attachments(&self) -> &HashMap<String, String> {
        &self.attachments
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    pub fn set_attachment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attachments.insert(key.into(), value.into());
    }

    pub fn remove_attachment(&mut self, key: &str) -> Option<String> {
        self.attachments.remove(key)
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed read of a value; `None` when missing or of another shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Store any serializable value.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.values.insert(key.into(), value);
        Ok(())
    }

    pub fn remove_value(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Snapshot of the context bound to the current task, empty outside of a call.
    ///
    /// Inside a [`with_current`](Self::with_current) closure the context is
    /// being mutated; the snapshot is empty there too.
    pub fn current() -> CallContext {
        CURRENT
            .try_with(|current| {
                current
                    .try_borrow()
                    .map(|c| c.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Take the current context along to a continuation running on another
    /// task; bind it there with [`scope`](Self::scope).
    pub fn capture() -> CallContext {
        Self::current()
    }

    /// Mutate the context bound to the current task.
    ///
    /// Returns `None` when no context is bound, or when called again from
    /// inside `f`. Read the context through the `&mut` handed to `f`, not
    /// through [`current`](Self::current).
    pub fn with_current<R>(f: impl FnOnce(&mut CallContext) -> R) -> Option<R> {
        CURRENT
            .try_with(|current| {
                current
                    .try_borrow_mut()
                    .ok()
                    .map(|mut c| f(&mut *c))
            })
            .ok()
            .flatten()
    }

    /// Run `future` with this context bound as the current one.
    ///
    /// The binding ends when the future completes, so nothing leaks into
    /// whatever the task runs next.
    pub fn scope<F: Future>(self, future: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(RefCell::new(self), future)
    }

    /// Write the context into `metadata`, replacing previous entries.
    pub fn encode_into(&self, metadata: &mut Metadata) {
        match encode_entry(&self.attachments) {
            Ok(v) => {
                metadata.insert(ATTACHMENTS_KEY, v);
            }
            Err(e) => log::error!("encode call attachments error: {}", e),
        }
        match encode_entry(&self.values) {
            Ok(v) => {
                metadata.insert(VALUES_KEY, v);
            }
            Err(e) => log::error!("encode call values error: {}", e),
        }
    }

    /// Read a context from `metadata`. A missing entry reads as empty.
    pub fn decode_from(metadata: &Metadata) -> Result<CallContext, ContextDecodeError> {
        Ok(CallContext {
            attachments: decode_entry(metadata, ATTACHMENTS_KEY)?,
            values: decode_entry(metadata, VALUES_KEY)?,
        })
    }
}

fn encode_entry<T: Serialize>(entry: &T) -> serde_json::Result<String> {
    Ok(STANDARD.encode(serde_json::to_vec(entry)?))
}

fn decode_entry<T: DeserializeOwned + Default>(
    metadata: &Metadata,
    entry: &'static str,
) -> Result<T, ContextDecodeError> {
    let Some(raw) = metadata.get(entry) else {
        return Ok(T::default());
    };
    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|source| ContextDecodeError::Base64 { entry, source })?;
    serde_json::from_slice(&bytes).map_err(|source| ContextDecodeError::Json { entry, source })
}
