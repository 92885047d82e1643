//! In-memory state store for tests and embedding.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use super::{validate_key, LockStatus, StateStore};
use crate::error::Result;

/// State store backed by a mutex-guarded map.
///
/// Updates are always serialized, so they report [`LockStatus::Locked`].
///
/// # Example
///
/// ```rust
/// use warden::state::{MemoryStore, StateStore};
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store.write_value("api-health", &json!({})).unwrap();
/// assert!(store.read_value("api-health").unwrap().is_some());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// Returns true if nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StateStore for MemoryStore {
    fn read_value(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        Ok(self.records().get(key).cloned())
    }

    fn write_value(&self, key: &str, value: &Value) -> Result<()> {
        validate_key(key)?;
        self.records().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn update_value(
        &self,
        key: &str,
        update: &mut dyn FnMut(Option<Value>) -> Result<Value>,
    ) -> Result<LockStatus> {
        validate_key(key)?;
        let mut records = self.records();
        let next = update(records.get(key).cloned())?;
        records.insert(key.to_string(), next);
        Ok(LockStatus::Locked)
    }
}
