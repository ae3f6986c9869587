//! Native storage primitive: a flat, string-keyed, string-valued
//! persistent map with an enumerable key listing.

use crate::{
    config::{StorageBackend, StorageConfig},
    Error, Result,
};
use kv::{Bucket, Store};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex},
};

pub trait NativeStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Create or replace.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    fn keys(&self) -> Result<Vec<String>>;

    /// Remove several keys. Backends that support it apply this atomically;
    /// the default is a best-effort loop.
    fn remove_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }
}

pub fn open(config: &StorageConfig) -> Result<Arc<dyn NativeStorage>> {
    Ok(match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::default()),
        StorageBackend::Kv => Arc::new(KvStorage::new(&config.path, &config.bucket)?),
    })
}

/// In-process map; contents are lost when dropped.
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NativeStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map().keys().cloned().collect())
    }

    fn remove_many(&self, keys: &[String]) -> Result<()> {
        let mut map = self.map();
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }
}

/// Sled-backed storage through the `kv` crate, one bucket per store.
#[derive(Clone)]
pub struct KvStorage {
    _store: Store,
    bucket: Bucket<'static, String, String>,
}

impl KvStorage {
    pub fn new<P: AsRef<Path>>(path: P, bucket: &str) -> Result<Self> {
        tracing::info!("opening kv storage: {}", path.as_ref().display());
        let store = Store::new(kv::Config::new(path.as_ref())).map_err(Error::storage("open"))?;
        let bucket = store
            .bucket::<String, String>(Some(bucket))
            .map_err(Error::storage("open bucket"))?;
        Ok(Self {
            _store: store,
            bucket,
        })
    }
}

impl NativeStorage for KvStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.bucket
            .get(&key.to_owned())
            .map_err(Error::storage("get"))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.bucket
            .set(&key.to_owned(), &value.to_owned())
            .map_err(Error::storage("set"))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.bucket
            .remove(&key.to_owned())
            .map_err(Error::storage("remove"))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.bucket
            .iter()
            .map(|item| {
                item.map_err(Error::storage("iter"))?
                    .key::<String>()
                    .map_err(Error::storage("decode key"))
            })
            .collect()
    }

    fn remove_many(&self, keys: &[String]) -> Result<()> {
        let mut batch = kv::Batch::new();
        for key in keys {
            batch.remove(key).map_err(Error::storage("batch remove"))?;
        }
        self.bucket
            .batch(batch)
            .map_err(Error::storage("apply batch"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(storage: &dyn NativeStorage) {
        assert_eq!(storage.get("a").unwrap(), None);
        storage.set("a", "1").unwrap();
        storage.set("b", "2").unwrap();
        storage.set("a", "3").unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some("3"));

        let mut keys = storage.keys().unwrap();
        keys.sort();
        assert_eq!(keys, ["a", "b"]);

        storage.remove("missing").unwrap();
        storage.remove_many(&["a".to_owned(), "b".to_owned()]).unwrap();
        assert!(storage.keys().unwrap().is_empty());
    }

    #[test]
    fn test_memory_storage() {
        exercise(&MemoryStorage::default());
    }

    #[test]
    fn test_kv_storage() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&KvStorage::new(dir.path(), "userfs").unwrap());
    }
}
