//! Durable, bounded JSON key/value storage for data that must outlive a failed network call.
//!
//! Writing strategy:
//! 1. Values are serialized to JSON and handed to a [`Storage`] backend as a single string.
//! 2. If the backend reports that its quota is exhausted, every array in the value is cut down
//!    to its most recent [`QUOTA_RETRY_KEEP`] elements and the write is retried once.
//! 3. If the retry fails as well, the key is removed. Losing one key is preferable to failing the caller.
//!
//! Reads never fail: a missing key and a value that no longer parses both read as `None`. Updates never
//! silently replace a value they could not parse, see [`Stash::update`].

pub mod dir;
pub mod memory;

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Serialize, de::DeserializeOwned};

pub use dir::DirStorage;
pub use memory::MemoryStorage;

/// How many trailing elements of each array survive a quota-triggered retry.
pub const QUOTA_RETRY_KEEP: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage quota exceeded while writing `{key}` ({needed} bytes needed, {quota} allowed)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        quota: usize,
    },
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw string key/value backend, the native counterpart of a browser's `localStorage`.
pub trait Storage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a key that does not exist is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// What actually happened to a [`Stash::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Stored,
    /// Stored after arrays were truncated to fit the quota.
    Truncated,
    /// Nothing was stored.
    Dropped,
}

pub struct Stash {
    storage: Box<dyn Storage>,
    // held for every read-modify-write so concurrent updates of one key can't interleave
    lock: Mutex<()>,
}

impl std::fmt::Debug for Stash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stash").finish_non_exhaustive()
    }
}

impl Stash {
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self {
            storage: Box::new(storage),
            lock: Mutex::new(()),
        }
    }

    /// A stash backed by process memory, gone when the process exits.
    pub fn in_memory() -> Self {
        Self::new(MemoryStorage::default())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let _guard = self.guard();
        self.get_unlocked(key)
    }

    /// The raw JSON stored under `key`, if it parses.
    pub fn get_json(&self, key: &str) -> Option<serde_json::Value> {
        self.get(key)
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Persisted {
        let _guard = self.guard();
        self.set_unlocked(key, value)
    }

    pub fn remove(&self, key: &str) {
        let _guard = self.guard();
        self.remove_unlocked(key);
    }

    /// Atomically reads `key`, lets `f` modify it (starting from `T::default()` if absent), and writes it back.
    /// Returns whatever `f` returns alongside the persistence result.
    ///
    /// A stored value that doesn't parse as `T` is moved to [`corrupt_key`] before being replaced. If it can't be
    /// moved, `key` is left alone and the result is [`Persisted::Dropped`].
    pub fn update<T, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> (R, Persisted)
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let _guard = self.guard();
        let mut value = T::default();
        let mut preserved = true;
        if let Some(raw) = self.read_unlocked(key) {
            match serde_json::from_str(&raw) {
                Ok(stored) => value = stored,
                Err(e) => preserved = self.set_aside_unlocked(key, &raw, &e),
            }
        }
        let result = f(&mut value);
        if !preserved {
            return (result, Persisted::Dropped);
        }
        let persisted = self.set_unlocked(key, &value);
        (result, persisted)
    }

    pub fn keys(&self) -> Vec<String> {
        self.storage.keys().unwrap_or_else(|e| {
            log::error!("Failed to list storage keys: {e:?}");
            Vec::new()
        })
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_unlocked(&self, key: &str) -> Option<String> {
        self.storage.get_item(key).unwrap_or_else(|e| {
            log::error!("Failed to read `{key}` from storage: {e:?}");
            None
        })
    }

    fn get_unlocked<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read_unlocked(key)?;
        serde_json::from_str(&raw)
            .inspect_err(|e| log::warn!("Ignoring unparsable value under `{key}`: {e}"))
            .ok()
    }

    fn set_aside_unlocked(&self, key: &str, raw: &str, error: &serde_json::Error) -> bool {
        let target = corrupt_key(key);
        match self.storage.set_item(&target, raw) {
            Ok(()) => {
                log::warn!("Moved unparsable value under `{key}` to `{target}`: {error}");
                true
            }
            Err(e) => {
                log::error!("Leaving unparsable `{key}` in place, could not move it to `{target}`: {e:?}");
                false
            }
        }
    }

    fn set_unlocked<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Persisted {
        let mut value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to serialize value for `{key}`: {e}");
                return Persisted::Dropped;
            }
        };

        match self.storage.set_item(key, &value.to_string()) {
            Ok(()) => return Persisted::Stored,
            Err(StorageError::QuotaExceeded { .. }) => {
                log::warn!(
                    "Storage quota exceeded for `{key}`, retrying with arrays cut to {QUOTA_RETRY_KEEP} entries"
                );
            }
            Err(e) => {
                log::error!("Failed to write `{key}`: {e:?}");
                return Persisted::Dropped;
            }
        }

        truncate_arrays(&mut value, QUOTA_RETRY_KEEP);
        match self.storage.set_item(key, &value.to_string()) {
            Ok(()) => Persisted::Truncated,
            Err(e) => {
                log::warn!("Retry for `{key}` failed ({e}), dropping the key");
                self.remove_unlocked(key);
                Persisted::Dropped
            }
        }
    }

    fn remove_unlocked(&self, key: &str) {
        if let Err(e) = self.storage.remove_item(key) {
            log::error!("Failed to remove `{key}`: {e:?}");
        }
    }
}

/// Where [`Stash::update`] moves a value of `key` it could not parse.
pub fn corrupt_key(key: &str) -> String {
    format!("corrupt_{key}")
}

/// Keeps the last `keep` elements of `value` if it is an array, and of every array-valued field if it is an object.
/// Returns whether anything was removed.
pub fn truncate_arrays(value: &mut serde_json::Value, keep: usize) -> bool {
    fn keep_tail(items: &mut Vec<serde_json::Value>, keep: usize) -> bool {
        if items.len() <= keep {
            return false;
        }
        items.drain(..items.len() - keep);
        true
    }

    match value {
        serde_json::Value::Array(items) => keep_tail(items, keep),
        serde_json::Value::Object(fields) => {
            let mut truncated = false;
            for field in fields.values_mut() {
                if let serde_json::Value::Array(items) = field {
                    truncated |= keep_tail(items, keep);
                }
            }
            truncated
        }
        _ => false,
    }
}
