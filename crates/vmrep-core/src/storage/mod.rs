//! Remote stores that incremental backups are written to.

pub mod local_backend;
pub mod lock;

use crate::config::RemoteConfig;
use crate::error::{Result, VmrepError};

use self::local_backend::LocalBackend;

/// Key/value object store. Keys are `/`-separated relative paths.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Every key under `prefix`, recursively.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Delete every key under `prefix`. Returns the number of deleted keys.
pub fn delete_prefix(storage: &dyn StorageBackend, prefix: &str) -> Result<usize> {
    let keys = storage.list(prefix)?;
    for key in &keys {
        storage.delete(key)?;
    }
    Ok(keys.len())
}

/// Build a storage backend for a configured remote.
pub fn backend_from_config(cfg: &RemoteConfig) -> Result<Box<dyn StorageBackend>> {
    let url = cfg.url.trim();
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Box::new(LocalBackend::new(path)?));
    }
    if url.contains("://") {
        return Err(VmrepError::UnsupportedBackend(url.to_string()));
    }
    Ok(Box::new(LocalBackend::new(url)?))
}
