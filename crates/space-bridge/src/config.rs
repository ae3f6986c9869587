use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    #[default]
    Kv,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "StorageConfig::default_path")]
    pub path: PathBuf,
    #[serde(default = "StorageConfig::default_bucket")]
    pub bucket: String,
}

impl StorageConfig {
    pub fn default_path() -> PathBuf {
        PathBuf::from("./userfs_storage")
    }

    pub fn default_bucket() -> String {
        "userfs".to_owned()
    }

    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            ..Self::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: Self::default_path(),
            bucket: Self::default_bucket(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct HttpConfig {
    pub user_agent: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct BridgeConfig {
    /// Namespace set before the guest runs; the guest's `userfs_init` still
    /// overrides it.
    pub app_name: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl BridgeConfig {
    pub fn from_toml(s: &str) -> crate::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_toml("").unwrap();
        assert_eq!(config.app_name, None);
        assert_eq!(config.storage.backend, StorageBackend::Kv);
        assert_eq!(config.storage.path, PathBuf::from("./userfs_storage"));
        assert_eq!(config.storage.bucket, "userfs");
    }

    #[test]
    fn test_parse() {
        let config = BridgeConfig::from_toml(
            r#"
            app_name = "demo"

            [storage]
            backend = "memory"

            [http]
            user_agent = "space-bridge"
            connect_timeout_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.app_name.as_deref(), Some("demo"));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.http.connect_timeout_ms, Some(2000));
    }
}
