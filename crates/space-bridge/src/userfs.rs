//! Key-value bridge over the native storage primitive.
//!
//! Every guest key is namespaced by the application name:
//! `userfs/<app_name>/<key>`, and values are stored base64-encoded since
//! the primitive only holds strings.

use crate::{codec, storage::NativeStorage, Error, Result};
use serde::Serialize;
use std::sync::Arc;

pub const KEY_ROOT: &str = "userfs";

pub struct UserFs {
    storage: Arc<dyn NativeStorage>,
    app_name: Option<String>,
}

/// Per-application storage usage.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub app_name: String,
    /// Sorted `(key, decoded size)` pairs.
    pub entries: Vec<(String, usize)>,
    pub total_keys: usize,
    pub total_bytes: usize,
}

impl UserFs {
    pub fn new(storage: Arc<dyn NativeStorage>) -> Self {
        Self {
            storage,
            app_name: None,
        }
    }

    /// Set the namespace. Calling it again re-namespaces every later
    /// operation; data under the old name stays in storage.
    ///
    /// A name containing `/` would overlap another namespace and is
    /// refused, leaving the current one in place.
    pub fn init(&mut self, app_name: impl Into<String>) -> Result<()> {
        let app_name = app_name.into();
        if app_name.contains('/') {
            return Err(Error::InvalidAppName(app_name));
        }
        if let Some(old) = self.app_name.as_deref().filter(|old| *old != app_name) {
            tracing::info!("switching namespace {:?} -> {:?}", old, app_name);
        }
        self.app_name = Some(app_name);
        Ok(())
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    /// `userfs/<app_name>/`
    fn prefix(&self) -> Result<String> {
        let app_name = self.app_name.as_deref().ok_or(Error::NoAppName)?;
        Ok(format!("{KEY_ROOT}/{app_name}/"))
    }

    /// Absolute storage key. The empty key is rejected.
    pub fn abs_key(&self, key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        Ok(format!("{}{key}", self.prefix()?))
    }

    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.storage.get(&self.abs_key(key)?)? {
            Some(text) => Ok(Some(codec::decode(&text)?)),
            None => Ok(None),
        }
    }

    pub fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.storage.set(&self.abs_key(key)?, &codec::encode(data))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.storage.remove(&self.abs_key(key)?)
    }

    /// Remove every key of the current namespace.
    pub fn reset(&self) -> Result<()> {
        let prefix = self.prefix()?;
        let keys = self
            .keys()?
            .into_iter()
            .map(|key| format!("{prefix}{key}"))
            .collect::<Vec<_>>();
        tracing::debug!("reset {}: removing {} keys", prefix, keys.len());
        self.storage.remove_many(&keys)
    }

    /// Keys of the current namespace, without the prefix.
    pub fn keys(&self) -> Result<Vec<String>> {
        let prefix = self.prefix()?;
        Ok(self
            .storage
            .keys()?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(str::to_owned)
            })
            .collect())
    }

    pub fn query_bytes(&self, key: &str) -> Option<Vec<u8>> {
        match self.read(key) {
            Ok(Some(bytes)) => Some(bytes),
            Ok(None) => {
                tracing::error!("key {:?} was not found", key);
                None
            }
            Err(error) => {
                tracing::error!("query {:?}: {}", key, error);
                None
            }
        }
    }

    pub fn query_text(&self, key: &str) -> Option<String> {
        self.query_bytes(key)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn info(&self) -> Result<UsageReport> {
        let app_name = self.app_name.clone().ok_or(Error::NoAppName)?;
        let mut keys = self.keys()?;
        keys.sort();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let size = self.read(&key)?.map(|v| v.len()).unwrap_or_default();
            entries.push((key, size));
        }
        let total_bytes = entries.iter().map(|(_, size)| size).sum();
        let report = UsageReport {
            app_name,
            total_keys: entries.len(),
            entries,
            total_bytes,
        };

        tracing::info!("app: {:?}", report.app_name);
        tracing::info!("total keys: {}", report.total_keys);
        tracing::info!("total bytes: {}", report.total_bytes);
        for (key, size) in &report.entries {
            tracing::info!("  {key}: {size}");
        }
        Ok(report)
    }
}
