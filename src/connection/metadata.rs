//! Per-connection metadata map
//!
//! Elements on the same side of the transport boundary share state for a
//! connection through this map (the tunnel interface index, pinholes to
//! open). The map is process-local: it is skipped when a connection is
//! serialized, and the `Metadata` element keys it by connection id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::ChainError;

/// Shared, mutable key-value map scoped to one connection
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MetadataMap {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl MetadataMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous value
    ///
    /// # Errors
    ///
    /// Returns `ChainError::Metadata` if the value does not serialize. The
    /// previous value, if any, is kept.
    pub fn insert<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ChainError> {
        let value = serde_json::to_value(value).map_err(|e| ChainError::Metadata {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.inner.write().insert(key.to_string(), value);
        Ok(())
    }

    /// Load the value stored under `key`
    ///
    /// Returns `None` when the key is missing or holds a different type.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.inner.read().get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    /// Remove and return the value stored under `key`
    pub fn remove<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.inner.write().remove(key)?;
        serde_json::from_value(value).ok()
    }

    /// Check if `key` is present
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Check if two handles share the same underlying map
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
