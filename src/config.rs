use crate::error::{Result, StashError};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

fn default_cache_dir() -> String {
    "/tmp/stashfs/cache".to_string()
}

fn default_store_root() -> String {
    "/tmp/stashfs/store".to_string()
}

fn default_cache_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Proxy-side settings: where whole-file copies land and how many
/// distinct paths the eviction cache tracks at once.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

impl CacheConfig {
    pub fn get_dir(&self) -> PathBuf {
        PathBuf::from(self.dir.clone().unwrap_or_else(default_cache_dir))
    }

    pub fn get_capacity(&self) -> Result<NonZeroUsize> {
        let capacity = self.capacity.unwrap_or_else(default_cache_capacity);
        NonZeroUsize::new(capacity).ok_or_else(|| {
            StashError::Config("cache.capacity must be at least 1".to_string())
        })
    }
}

/// Authoritative store settings. `root` is the blob directory of the
/// in-process store; a remote transport would carry an address here instead.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl StoreConfig {
    pub fn get_root(&self) -> PathBuf {
        PathBuf::from(self.root.clone().unwrap_or_else(default_store_root))
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };

    let content = std::fs::read_to_string(path).map_err(|e| {
        StashError::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    toml::from_str(&content).map_err(|e| {
        StashError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_sections_missing() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.get_dir(), PathBuf::from("/tmp/stashfs/cache"));
        assert_eq!(config.cache.get_capacity().unwrap().get(), 64);
        assert_eq!(config.store.get_root(), PathBuf::from("/tmp/stashfs/store"));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            dir = "/var/cache/stashfs"
            capacity = 8

            [store]
            root = "/srv/files"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.get_dir(), PathBuf::from("/var/cache/stashfs"));
        assert_eq!(config.cache.get_capacity().unwrap().get(), 8);
        assert_eq!(config.store.get_root(), PathBuf::from("/srv/files"));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config: Config = toml::from_str("[cache]\ncapacity = 0\n").unwrap();
        assert!(config.cache.get_capacity().is_err());
    }
}
