//! Durable key-value state shared between short-lived hook processes.
//!
//! Every stateful component (circuit breaker, loop detector) receives a
//! [`StateStore`] handle instead of touching files directly. The store offers
//! three operations:
//!
//! - [`StateStore::read_value`] - read a record, `None` when it does not exist
//! - [`StateStore::write_value`] - replace a record atomically
//! - [`StateStore::update_value`] - locked read-modify-write
//!
//! # Architecture
//!
//! ```text
//! CircuitBreaker ──┐
//!                  ├──> StateStoreExt::update<T> ──> StateStore::update_value
//! LoopTracker ─────┘                                     │
//!                                          ┌─────────────┴─────────────┐
//!                                          ▼                           ▼
//!                                     FileStore                  MemoryStore
//!                             (fs2 lock + tmp/rename)          (Mutex<HashMap>)
//! ```
//!
//! # Locking
//!
//! [`FileStore`] takes a non-blocking advisory lock on a sidecar file. When the
//! lock cannot be taken the update still runs, unlocked, and the returned
//! [`LockStatus`] says so. The worst outcome of that race is a lost counter
//! increment, never a torn file, because writes always go through an atomic
//! rename.

pub mod file;
pub mod memory;

pub use file::{FileStore, LockPolicy};
pub use memory::MemoryStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, WardenError};

/// Why an update ran without holding the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFailure {
    /// Locking was switched off by the [`LockPolicy`].
    Disabled,
    /// Another process held the lock for every attempt.
    Contended,
    /// The platform or file system refused the lock.
    Unavailable(String),
}

impl std::fmt::Display for LockFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "locking disabled"),
            Self::Contended => write!(f, "lock contended"),
            Self::Unavailable(reason) => write!(f, "lock unavailable: {reason}"),
        }
    }
}

/// Outcome of the lock attempt made by an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The read-modify-write ran while holding the exclusive lock.
    Locked,
    /// The read-modify-write ran in best-effort mode.
    Unlocked(LockFailure),
}

impl LockStatus {
    /// Returns true if the update held the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

/// Result of a typed update: the closure's return value plus the lock outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Updated<R> {
    pub value: R,
    pub lock: LockStatus,
}

/// Key-value store over small JSON records.
///
/// Keys are plain names such as `api-health` or `loop-state-3f2a9c1d`.
pub trait StateStore {
    /// Read the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read or parsed.
    fn read_value(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the record stored under `key` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn write_value(&self, key: &str, value: &Value) -> Result<()>;

    /// Locked read-modify-write of the record stored under `key`.
    ///
    /// `update` receives the current record (`None` when missing or corrupt)
    /// and returns the record to persist. It is invoked exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if `update` fails or the result cannot be written.
    /// Failing to take the lock is not an error; see [`LockStatus`].
    fn update_value(
        &self,
        key: &str,
        update: &mut dyn FnMut(Option<Value>) -> Result<Value>,
    ) -> Result<LockStatus>;
}

impl<S: StateStore + ?Sized> StateStore for &S {
    fn read_value(&self, key: &str) -> Result<Option<Value>> {
        (**self).read_value(key)
    }

    fn write_value(&self, key: &str, value: &Value) -> Result<()> {
        (**self).write_value(key, value)
    }

    fn update_value(
        &self,
        key: &str,
        update: &mut dyn FnMut(Option<Value>) -> Result<Value>,
    ) -> Result<LockStatus> {
        (**self).update_value(key, update)
    }
}

/// Typed helpers over any [`StateStore`].
pub trait StateStoreExt: StateStore {
    /// Read and deserialize the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unreadable or has the wrong shape.
    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_value(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Serialize and write `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.write_value(key, &serde_json::to_value(value)?)
    }

    /// Locked read-modify-write over a typed record.
    ///
    /// Missing records and records that fail to deserialize start from
    /// `T::default()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to persist the new record.
    fn update<T, R, F>(&self, key: &str, mut mutate: F) -> Result<Updated<R>>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnMut(&mut T) -> R,
    {
        let mut output = None;
        let lock = self.update_value(key, &mut |current| {
            let mut record = decode_or_default::<T>(key, current);
            output = Some(mutate(&mut record));
            Ok(serde_json::to_value(&record)?)
        })?;

        let value = output.ok_or_else(|| WardenError::UpdateSkipped {
            key: key.to_string(),
        })?;
        Ok(Updated { value, lock })
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

fn decode_or_default<T: DeserializeOwned + Default>(key: &str, current: Option<Value>) -> T {
    match current {
        Some(value) => match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!("State record '{}' has an unexpected shape, starting fresh: {}", key, e);
                T::default()
            }
        },
        None => T::default(),
    }
}

/// Validate that a key maps to a single file name.
///
/// # Errors
///
/// Returns [`WardenError::InvalidStateKey`] for empty keys, keys starting with
/// a dot, or keys containing anything other than ASCII alphanumerics, `-`,
/// `_` and `.`.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WardenError::InvalidStateKey {
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        count: u32,
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("api-health").is_ok());
        assert!(validate_key("loop-state-3f2a9c1d").is_ok());
        assert!(validate_key("token_usage.v2").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key(".hidden").is_err());
        assert!(validate_key("a/b").is_err());
    }

    #[test]
    fn test_typed_read_missing_is_none() {
        let store = MemoryStore::new();
        let value: Option<Counter> = store.read("missing").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_typed_update_starts_from_default() {
        let store = MemoryStore::new();
        let updated = store
            .update("counter", |c: &mut Counter| {
                c.count += 1;
                c.count
            })
            .unwrap();
        assert_eq!(updated.value, 1);
        assert!(updated.lock.is_locked());

        let stored: Counter = store.read("counter").unwrap().unwrap();
        assert_eq!(stored.count, 1);
    }

    #[test]
    fn test_typed_update_wrong_shape_starts_fresh() {
        let store = MemoryStore::new();
        store.write_value("counter", &json!(["not", "a", "counter"])).unwrap();

        let updated = store
            .update("counter", |c: &mut Counter| {
                c.count += 1;
                c.count
            })
            .unwrap();
        assert_eq!(updated.value, 1);
    }

    #[test]
    fn test_typed_write_then_read() {
        let store = MemoryStore::new();
        store.write("counter", &Counter { count: 7 }).unwrap();
        let stored: Counter = store.read("counter").unwrap().unwrap();
        assert_eq!(stored, Counter { count: 7 });
    }

    #[test]
    fn test_lock_failure_display() {
        assert_eq!(LockFailure::Disabled.to_string(), "locking disabled");
        assert!(LockFailure::Unavailable("ENOLCK".into())
            .to_string()
            .contains("ENOLCK"));
    }
}
