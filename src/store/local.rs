use crate::error::{Result, StashError};
use crate::store::RemoteStore;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// In-process authoritative store: a directory of byte blobs addressable by
/// canonical relative path, a per-path version map, and the shared
/// client-id counter.
///
/// The mutable counters live behind explicit mutexes owned by this value;
/// nothing here is process-global.
pub struct LocalStore {
    root: PathBuf,
    versions: Mutex<FxHashMap<String, u64>>,
    next_client: Mutex<u64>,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).map_err(|e| {
            StashError::Config(format!(
                "Failed to create store root {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(LocalStore {
            root,
            versions: Mutex::new(FxHashMap::default()),
            next_client: Mutex::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl RemoteStore for LocalStore {
    fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let blob = self.blob_path(path);
        if !blob.is_file() {
            return Err(StashError::NotFound(PathBuf::from(path)));
        }
        let bytes = std::fs::read(&blob)?;
        tracing::debug!("fetch: {:?} ({} bytes)", path, bytes.len());
        Ok(bytes)
    }

    fn push(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let blob = self.blob_path(path);
        if let Some(parent) = blob.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Full overwrite: the file must end up exactly `bytes`, so truncate
        // rather than write in place.
        std::fs::write(&blob, bytes)?;

        let mut versions = self.versions.lock();
        let version = versions.entry(path.to_string()).or_insert(0);
        *version += 1;
        tracing::debug!("push: {:?} ({} bytes) -> version {}", path, bytes.len(), version);
        Ok(())
    }

    fn version(&self, path: &str) -> Result<u64> {
        Ok(self.versions.lock().get(path).copied().unwrap_or(0))
    }

    fn set_version(&self, path: &str, version: u64) -> Result<()> {
        self.versions.lock().insert(path.to_string(), version);
        Ok(())
    }

    fn client_id(&self) -> Result<u64> {
        Ok(*self.next_client.lock())
    }

    fn set_client_id(&self, value: u64) -> Result<()> {
        *self.next_client.lock() = value;
        Ok(())
    }
}
