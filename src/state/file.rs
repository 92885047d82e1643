//! File-backed state store with atomic writes and advisory locking.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::{validate_key, LockFailure, LockStatus, StateStore};
use crate::error::{Result, WardenError};

/// Extension of every state record.
const STATE_EXT: &str = "json";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Distinguishes temporary files written by threads of the same process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How hard [`FileStore`] tries to take the sidecar lock.
///
/// Every attempt is non-blocking. The default makes a single attempt, so an
/// update never waits on another process. [`LockPolicy::new`] opts into
/// retries: between attempts the store sleeps for `retry_delay`, so the
/// longest an update can stall is `attempts * retry_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Whether to lock at all.
    pub enabled: bool,
    /// Number of non-blocking attempts before running unlocked.
    pub attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 1,
            retry_delay: Duration::ZERO,
        }
    }
}

impl LockPolicy {
    /// A retrying policy with a custom attempt budget.
    #[must_use]
    pub fn new(attempts: u32, retry_delay: Duration) -> Self {
        Self {
            enabled: true,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    /// A policy that never locks.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// State store keeping one JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    /// Directory where state files are stored.
    dir: PathBuf,
    lock_policy: LockPolicy,
}

impl FileStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            lock_policy: LockPolicy::default(),
        }
    }

    /// Replaces the lock policy.
    #[must_use]
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// Returns the directory holding the state files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the record stored under `key`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{STATE_EXT}"))
    }

    /// Returns the path of the sidecar lock file for `key`.
    #[must_use]
    pub fn lock_path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{STATE_EXT}{LOCK_SUFFIX}"))
    }

    fn tmp_path_for(&self, key: &str) -> PathBuf {
        let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            ".{key}.{STATE_EXT}.{}.{seq}{TMP_SUFFIX}",
            std::process::id()
        ))
    }

    /// Takes the sidecar lock according to the policy.
    ///
    /// Returns the open lock file when the lock is held; dropping it releases
    /// the lock.
    fn acquire(&self, key: &str) -> (Option<File>, LockStatus) {
        if !self.lock_policy.enabled {
            return (None, LockStatus::Unlocked(LockFailure::Disabled));
        }

        let lock_file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path_for(key))
        {
            Ok(f) => f,
            Err(e) => {
                return (
                    None,
                    LockStatus::Unlocked(LockFailure::Unavailable(e.to_string())),
                )
            }
        };

        let contended = fs2::lock_contended_error().kind();
        for attempt in 1..=self.lock_policy.attempts {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => {
                    debug!("Locked state '{}' after {} attempt(s)", key, attempt);
                    return (Some(lock_file), LockStatus::Locked);
                }
                Err(e) if e.kind() == contended => {
                    if attempt < self.lock_policy.attempts {
                        thread::sleep(self.lock_policy.retry_delay);
                    }
                }
                Err(e) => {
                    return (
                        None,
                        LockStatus::Unlocked(LockFailure::Unavailable(e.to_string())),
                    )
                }
            }
        }

        (None, LockStatus::Unlocked(LockFailure::Contended))
    }

    fn read_path(path: &Path) -> Result<Option<Value>> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| WardenError::CorruptState {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }
}

impl StateStore for FileStore {
    fn read_value(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        Self::read_path(&self.path_for(key))
    }

    fn write_value(&self, key: &str, value: &Value) -> Result<()> {
        validate_key(key)?;
        fs::create_dir_all(&self.dir)?;

        let tmp_path = self.tmp_path_for(key);
        let json = serde_json::to_string_pretty(value)?;

        let written = (|| -> Result<()> {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(json.as_bytes())?;
            tmp_file.sync_all()?;
            fs::rename(&tmp_path, self.path_for(key))?;
            Ok(())
        })();

        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written
    }

    fn update_value(
        &self,
        key: &str,
        update: &mut dyn FnMut(Option<Value>) -> Result<Value>,
    ) -> Result<LockStatus> {
        validate_key(key)?;
        fs::create_dir_all(&self.dir)?;

        let (lock_file, status) = self.acquire(key);
        if let LockStatus::Unlocked(ref failure) = status {
            warn!("Updating state '{}' without lock ({})", key, failure);
        }

        let current = match Self::read_path(&self.path_for(key)) {
            Ok(v) => v,
            Err(WardenError::CorruptState { path, message }) => {
                warn!(
                    "Corrupted state file at {}: {}. Starting fresh.",
                    path.display(),
                    message
                );
                None
            }
            Err(e) => return Err(e),
        };

        let next = update(current)?;
        self.write_value(key, &next)?;

        if let Some(lock_file) = lock_file {
            let _ = FileExt::unlock(&lock_file);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStoreExt;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    fn test_store() -> (FileStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::new(temp_dir.path().join("state"));
        (store, temp_dir)
    }

    #[test]
    fn test_read_missing_returns_none() {
        let (store, _temp_dir) = test_store();
        assert!(store.read_value("api-health").unwrap().is_none());
    }

    #[test]
    fn test_write_creates_directory_and_file() {
        let (store, _temp_dir) = test_store();
        assert!(!store.dir().exists());

        store.write_value("api-health", &json!({"todoist": {}})).unwrap();

        assert!(store.dir().exists());
        assert!(store.path_for("api-health").exists());
    }

    #[test]
    fn test_write_leaves_no_tmp_files() {
        let (store, _temp_dir) = test_store();
        store.write_value("api-health", &json!({"a": 1})).unwrap();
        store.write_value("api-health", &json!({"a": 2})).unwrap();

        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(TMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(store.read_value("api-health").unwrap(), Some(json!({"a": 2})));
    }

    #[test]
    fn test_read_corrupt_file_is_error() {
        let (store, _temp_dir) = test_store();
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.path_for("api-health"), "not valid json {{{").unwrap();

        let err = store.read_value("api-health").unwrap_err();
        assert!(matches!(err, WardenError::CorruptState { .. }));
    }

    #[test]
    fn test_read_empty_file_is_none() {
        let (store, _temp_dir) = test_store();
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.path_for("api-health"), "").unwrap();
        assert!(store.read_value("api-health").unwrap().is_none());
    }

    #[test]
    fn test_update_treats_corrupt_file_as_missing() {
        let (store, _temp_dir) = test_store();
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.path_for("counter"), "{{{").unwrap();

        let updated = store
            .update("counter", |c: &mut Counter| {
                c.count += 1;
                c.count
            })
            .unwrap();
        assert_eq!(updated.value, 1);
        assert_eq!(store.read_value("counter").unwrap(), Some(json!({"count": 1})));
    }

    #[test]
    fn test_update_holds_lock_by_default() {
        let (store, _temp_dir) = test_store();
        let status = store.update_value("counter", &mut |_| Ok(json!({"count": 1}))).unwrap();
        assert_eq!(status, LockStatus::Locked);
        assert!(store.lock_path_for("counter").exists());
    }

    #[test]
    fn test_update_with_locking_disabled_still_persists() {
        let (store, _temp_dir) = test_store();
        let store = store.with_lock_policy(LockPolicy::disabled());

        let status = store.update_value("counter", &mut |_| Ok(json!({"count": 5}))).unwrap();
        assert_eq!(status, LockStatus::Unlocked(LockFailure::Disabled));
        assert_eq!(store.read_value("counter").unwrap(), Some(json!({"count": 5})));
    }

    #[test]
    fn test_update_degrades_when_lock_is_held() {
        let (store, _temp_dir) = test_store();
        let store = store.with_lock_policy(LockPolicy::new(2, Duration::from_millis(1)));
        fs::create_dir_all(store.dir()).unwrap();

        let holder = File::create(store.lock_path_for("counter")).unwrap();
        FileExt::lock_exclusive(&holder).expect("acquire lock");

        let status = store.update_value("counter", &mut |_| Ok(json!({"count": 9}))).unwrap();
        assert_eq!(status, LockStatus::Unlocked(LockFailure::Contended));
        assert_eq!(store.read_value("counter").unwrap(), Some(json!({"count": 9})));

        FileExt::unlock(&holder).expect("release lock");
        let status = store.update_value("counter", &mut |_| Ok(json!({"count": 10}))).unwrap();
        assert_eq!(status, LockStatus::Locked);
    }

    #[test]
    fn test_default_policy_does_not_wait_for_held_lock() {
        let (store, _temp_dir) = test_store();
        assert_eq!(LockPolicy::default().attempts, 1);
        fs::create_dir_all(store.dir()).unwrap();

        let holder = File::create(store.lock_path_for("counter")).unwrap();
        FileExt::lock_exclusive(&holder).expect("acquire lock");

        let started = std::time::Instant::now();
        let status = store.update_value("counter", &mut |_| Ok(json!({"count": 2}))).unwrap();
        assert_eq!(status, LockStatus::Unlocked(LockFailure::Contended));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(store.read_value("counter").unwrap(), Some(json!({"count": 2})));

        FileExt::unlock(&holder).expect("release lock");
    }

    #[test]
    fn test_update_error_leaves_previous_value() {
        let (store, _temp_dir) = test_store();
        store.write_value("counter", &json!({"count": 3})).unwrap();

        let result = store.update_value("counter", &mut |_| Err(WardenError::config("nope")));
        assert!(result.is_err());
        assert_eq!(store.read_value("counter").unwrap(), Some(json!({"count": 3})));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let (store, _temp_dir) = test_store();
        assert!(store.write_value("../escape", &json!({})).is_err());
        assert!(store.read_value("a/b").is_err());
    }

    #[test]
    fn test_concurrent_locked_updates_never_lose_increments() {
        let (store, _temp_dir) = test_store();
        let store = Arc::new(
            store.with_lock_policy(LockPolicy::new(5_000, Duration::from_millis(1))),
        );

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut statuses = Vec::new();
                    for _ in 0..25 {
                        let updated = store
                            .update("counter", |c: &mut Counter| c.count += 1)
                            .expect("update should succeed");
                        statuses.push(updated.lock);
                    }
                    statuses
                })
            })
            .collect();

        for worker in workers {
            let statuses = worker.join().expect("worker panicked");
            assert!(statuses.iter().all(LockStatus::is_locked));
        }

        let counter: Counter = store.read("counter").unwrap().unwrap();
        assert_eq!(counter.count, 100);
    }
}
