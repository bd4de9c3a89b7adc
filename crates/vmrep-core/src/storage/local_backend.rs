use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Result, VmrepError};
use crate::storage::StorageBackend;

/// Remote stored in a local (or locally mounted) directory. Keys map to
/// relative paths below the root.
pub struct LocalBackend {
    root: PathBuf,
}

/// Map `NotFound` to `missing`, propagate everything else.
fn or_missing<T>(result: io::Result<T>, missing: T) -> Result<T> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(missing),
        other => Ok(other?),
    }
}

impl LocalBackend {
    pub fn new(root: &str) -> Result<Self> {
        if root.trim().is_empty() {
            return Err(VmrepError::Config("remote path must not be empty".into()));
        }
        let root = PathBuf::from(root);
        // Canonical root so that keys computed from listed paths are stable.
        let root = if root.exists() {
            fs::canonicalize(&root)?
        } else {
            root
        };
        Ok(Self { root })
    }

    /// Keys are relative, `/` separated, and never leave the root.
    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let unsafe_key =
            |why: &str| VmrepError::InvalidFormat(format!("unsafe storage key '{key}': {why}"));
        if key.is_empty() {
            return Err(unsafe_key("empty"));
        }
        if key.contains('\\') {
            return Err(unsafe_key("backslash"));
        }
        for component in Path::new(key).components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return Err(unsafe_key("parent traversal")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(unsafe_key("absolute path"))
                }
            }
        }
        Ok(self.root.join(key))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        Some(parts.join("/"))
    }

    /// Remove directories left empty by a delete, up to the root.
    fn prune_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root || fs::remove_dir(current).is_err() {
                break;
            }
            debug!(dir = %current.display(), "removed empty directory");
            dir = current.parent();
        }
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        or_missing(fs::read(self.path_of(key)?).map(Some), None)
    }

    /// Written through a temporary file in the target directory and renamed
    /// into place: readers see either nothing or the whole object.
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_of(key)?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        or_missing(fs::remove_file(&path), ())?;
        self.prune_empty_parents(&path);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        or_missing(fs::metadata(self.path_of(key)?).map(|m| m.is_file()), false)
    }

    /// Every object below the directory `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.path_of(prefix)?
        };

        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let Some(entries) = or_missing(fs::read_dir(&dir).map(Some), None)? else {
                continue;
            };
            for entry in entries {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    keys.extend(self.key_of(&entry.path()));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
