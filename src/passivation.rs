//! Passivation Strategies
//!
//! When the instance cache holds more available entries than its capacity, the
//! oldest ones are handed to a [`PassivationStrategy`] and dropped from memory.
//! A later checkout of the same key asks the strategy to activate it again.
//!
//! ```text
//! ┌───────────────┐ passivate(batch) ┌────────────────────┐
//! │ InstanceCache │─────────────────▶│ PassivationStrategy│
//! │               │◀─────────────────│                    │
//! └───────────────┘ activate(key)    └─────────┬──────────┘
//!                                              │ SnapshotCodec
//!                                              ▼
//!                               memory map  /  one file per key
//! ```
//!
//! Stores are best-effort per value: a value that fails to encode or write is
//! logged and skipped while the rest of the batch is stored. A failure that
//! prevents the whole batch from being stored is returned to the cache, which
//! keeps the batch in memory.
//!
//! Activation is destructive. Once a value has been read back it is gone from
//! the store, so a key is never live in memory and stored at the same time.

use crate::error::PassivationError;
use crate::HashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::hash::Hash;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Stores and restores cache values that were evicted from memory.
pub trait PassivationStrategy<K, V>: Send + Sync {
    /// Stores every value in the batch.
    fn passivate(&self, batch: Vec<(K, V)>) -> Result<(), PassivationError>;

    /// Restores and forgets the value stored for `key`, or `None` if nothing is stored.
    fn activate(&self, key: &K) -> Result<Option<V>, PassivationError>;
}

/// Converts values to and from their stored byte form.
pub trait SnapshotCodec<V>: Send + Sync {
    /// Serializes a value.
    fn encode(&self, value: &V) -> Result<Vec<u8>, PassivationError>;

    /// Deserializes a value.
    fn decode(&self, bytes: &[u8]) -> Result<V, PassivationError>;
}

/// JSON codec for any serde type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Creates a codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T: Serialize + DeserializeOwned> SnapshotCodec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, PassivationError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, PassivationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Keeps encoded snapshots in process memory.
///
/// Useful for tests and for deployments that only want the cache's memory
/// bound, not durability.
pub struct MemoryPassivater<K, C> {
    codec: C,
    store: Mutex<HashMap<K, Vec<u8>>>,
}

impl<K: Hash + Eq, C> MemoryPassivater<K, C> {
    /// Creates an empty in-memory store.
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Number of values currently stored.
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    /// `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// `true` if a value is stored for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.store.lock().contains_key(key)
    }
}

impl<K, C> fmt::Debug for MemoryPassivater<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPassivater")
            .field("stored", &self.store.lock().len())
            .finish()
    }
}

impl<K, V, C> PassivationStrategy<K, V> for MemoryPassivater<K, C>
where
    K: Hash + Eq + fmt::Debug + Send + Sync,
    C: SnapshotCodec<V>,
{
    fn passivate(&self, batch: Vec<(K, V)>) -> Result<(), PassivationError> {
        let mut encoded = Vec::with_capacity(batch.len());
        for (key, value) in batch {
            match self.codec.encode(&value) {
                Ok(bytes) => encoded.push((key, bytes)),
                Err(err) => error!(key = ?key, error = %err, "failed to encode passivated value"),
            }
        }
        let mut store = self.store.lock();
        for (key, bytes) in encoded {
            store.insert(key, bytes);
        }
        Ok(())
    }

    fn activate(&self, key: &K) -> Result<Option<V>, PassivationError> {
        let bytes = self.store.lock().remove(key);
        match bytes {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Writes one file per key into a directory.
///
/// The file name is the key's `Display` form, so keys must render to valid,
/// unique file names.
pub struct DirectoryPassivater<C> {
    directory: PathBuf,
    codec: C,
}

impl<C> DirectoryPassivater<C> {
    /// Creates a store rooted at `directory`. The directory is created on the
    /// first store if it does not exist.
    pub fn new(directory: impl Into<PathBuf>, codec: C) -> Self {
        Self {
            directory: directory.into(),
            codec,
        }
    }

    /// Root directory of the store.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &impl fmt::Display) -> PathBuf {
        self.directory.join(key.to_string())
    }
}

impl<C> fmt::Debug for DirectoryPassivater<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryPassivater")
            .field("directory", &self.directory)
            .finish()
    }
}

impl<K, V, C> PassivationStrategy<K, V> for DirectoryPassivater<C>
where
    K: fmt::Display + fmt::Debug + Send + Sync,
    C: SnapshotCodec<V>,
{
    fn passivate(&self, batch: Vec<(K, V)>) -> Result<(), PassivationError> {
        fs::create_dir_all(&self.directory)?;
        for (key, value) in batch {
            let path = self.path_for(&key);
            let written = self
                .codec
                .encode(&value)
                .and_then(|bytes| fs::write(&path, bytes).map_err(PassivationError::from));
            match written {
                Ok(()) => debug!(key = %key, path = %path.display(), "passivated"),
                Err(err) => error!(key = ?key, error = %err, "failed to passivate value"),
            }
        }
        Ok(())
    }

    fn activate(&self, key: &K) -> Result<Option<V>, PassivationError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        fs::remove_file(&path)?;
        self.codec.decode(&bytes).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_activate_is_destructive() {
        let store = MemoryPassivater::new(JsonCodec::<String>::new());
        store
            .passivate(vec![(1u32, "one".to_string()), (2, "two".to_string())])
            .unwrap();
        assert_eq!(store.len(), 2);

        let value: Option<String> = store.activate(&1).unwrap();
        assert_eq!(value.as_deref(), Some("one"));
        let again: Option<String> = store.activate(&1).unwrap();
        assert!(again.is_none());
        assert!(store.contains(&2));
    }

    #[test]
    fn test_memory_decode_failure_is_reported() {
        struct Broken;
        impl SnapshotCodec<u8> for Broken {
            fn encode(&self, _: &u8) -> Result<Vec<u8>, PassivationError> {
                Ok(b"not json".to_vec())
            }
            fn decode(&self, bytes: &[u8]) -> Result<u8, PassivationError> {
                Ok(serde_json::from_slice(bytes)?)
            }
        }

        let store = MemoryPassivater::new(Broken);
        store.passivate(vec![("k", 1u8)]).unwrap();
        let result: Result<Option<u8>, _> = store.activate(&"k");
        assert!(matches!(result, Err(PassivationError::Codec(_))));
    }

    #[test]
    fn test_directory_round_trip_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryPassivater::new(dir.path().join("sessions"), JsonCodec::<Vec<u8>>::new());
        store.passivate(vec![("alpha", vec![1u8, 2, 3])]).unwrap();
        assert!(store.directory().join("alpha").exists());

        let value: Option<Vec<u8>> = store.activate(&"alpha").unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
        assert!(!store.directory().join("alpha").exists());

        let missing: Option<Vec<u8>> = store.activate(&"alpha").unwrap();
        assert!(missing.is_none());
    }
}
