//! Raw named-blob storage consumed by the engine.
//!
//! Keys are backend-defined strings. The engine never assumes folders exist;
//! it composes keys with `/` or `_` depending on the flat-namespace policy.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::{PersistError, Result};

const FILE_EXTENSION: &str = "sav";

/// Blob storage operations.
pub trait StorageBackend: Debug + Send + Sync {
    fn exists(&self, key: &str) -> bool;

    /// Store `bytes` under `key`, replacing what was there. Either the whole
    /// blob lands or the previous one stays.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Returns [`PersistError::StorageMissing`] when nothing is stored.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Returns whether something was removed.
    fn delete(&self, key: &str) -> Result<bool>;

    fn list_keys(&self) -> Result<Vec<String>>;

    /// Last write time, when the backend tracks one.
    fn modified(&self, key: &str) -> Option<SystemTime> {
        let _ = key;
        None
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    blobs: BTreeMap<String, (Vec<u8>, SystemTime)>,
    last_write: Option<SystemTime>,
}

/// In-memory backend. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryBackend {
    fn exists(&self, key: &str) -> bool {
        self.inner.read().blobs.contains_key(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        // Successive writes get strictly increasing stamps even within one
        // clock tick, so slot ordering stays total.
        let now = SystemTime::now();
        let stamp = match inner.last_write {
            Some(last) if now <= last => last + Duration::from_micros(1),
            _ => now,
        };
        inner.last_write = Some(stamp);
        inner.blobs.insert(key.to_owned(), (bytes.to_vec(), stamp));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner
            .read()
            .blobs
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| PersistError::StorageMissing {
                key: key.to_owned(),
            })
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.write().blobs.remove(key).is_some())
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().blobs.keys().cloned().collect())
    }

    fn modified(&self, key: &str) -> Option<SystemTime> {
        self.inner.read().blobs.get(key).map(|(_, stamp)| *stamp)
    }
}

/// One `.sav` file per key under a root directory. `/` in keys becomes a
/// directory level.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|source| io_error(&root.display().to_string(), source))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(io_error(
                key,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid storage key"),
            ));
        }
        Ok(self.root.join(format!("{key}.{FILE_EXTENSION}")))
    }

    fn collect(&self, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect(&path, out)?;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Ok(relative) = path.with_extension("").strip_prefix(&self.root).map(Path::to_path_buf) else {
                continue;
            };
            let key: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(key.join("/"));
        }
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn exists(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(key, e))?;
        }
        let tmp = path.with_extension(format!("{FILE_EXTENSION}.tmp"));
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            io_error(key, e)
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PersistError::StorageMissing {
                key: key.to_owned(),
            },
            _ => io_error(key, e),
        })
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                // Drop directories the key left empty; a non-empty one stops it.
                let mut dir = path.parent();
                while let Some(d) = dir {
                    if d == self.root || std::fs::remove_dir(d).is_err() {
                        break;
                    }
                    dir = d.parent();
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.collect(&self.root, &mut out)
            .map_err(|e| io_error(&self.root.display().to_string(), e))?;
        out.sort();
        Ok(out)
    }

    fn modified(&self, key: &str) -> Option<SystemTime> {
        let path = self.path_for(key).ok()?;
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}

fn io_error(key: &str, source: std::io::Error) -> PersistError {
    tracing::error!(key, error = %source, "storage failure");
    PersistError::StorageIo {
        key: key.to_owned(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(backend: &dyn StorageBackend) {
        assert!(!backend.exists("SaveGame1/Level"));
        assert!(matches!(
            backend.get("SaveGame1/Level"),
            Err(PersistError::StorageMissing { .. })
        ));

        backend.put("SaveGame1/Level", b"one").unwrap();
        backend.put("SaveGame1/Level", b"two").unwrap();
        backend.put("Users/ada/SaveGame1/Slot", b"slot").unwrap();
        assert!(backend.exists("SaveGame1/Level"));
        assert_eq!(backend.get("SaveGame1/Level").unwrap(), b"two");

        let keys = backend.list_keys().unwrap();
        assert_eq!(
            keys,
            vec![
                "SaveGame1/Level".to_owned(),
                "Users/ada/SaveGame1/Slot".to_owned()
            ]
        );

        assert!(backend.delete("SaveGame1/Level").unwrap());
        assert!(!backend.delete("SaveGame1/Level").unwrap());
        assert_eq!(backend.list_keys().unwrap().len(), 1);
    }

    #[test]
    fn memory_backend_contract() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn file_backend_contract() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(tmp.path().join("saves")).unwrap();
        exercise(&backend);
        assert!(backend.root().join("Users/ada/SaveGame1/Slot.sav").is_file());
        assert!(!backend.root().join("SaveGame1").exists());
    }

    #[test]
    fn memory_stamps_strictly_increase() {
        let backend = MemoryBackend::new();
        backend.put("a", b"").unwrap();
        backend.put("b", b"").unwrap();
        assert!(backend.modified("b").unwrap() > backend.modified("a").unwrap());
        assert!(backend.modified("c").is_none());
    }

    #[test]
    fn clones_share_contents() {
        let a = MemoryBackend::new();
        let b = a.clone();
        a.put("k", b"v").unwrap();
        assert_eq!(b.get("k").unwrap(), b"v");
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn file_backend_rejects_escaping_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(tmp.path()).unwrap();
        assert!(matches!(
            backend.put("../outside", b"x"),
            Err(PersistError::StorageIo { .. })
        ));
        assert!(!backend.exists(""));
    }

    #[test]
    fn flat_keys_need_no_folders() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(tmp.path()).unwrap();
        backend.put("SaveGame1_Player", b"p").unwrap();
        assert_eq!(backend.list_keys().unwrap(), vec!["SaveGame1_Player".to_owned()]);
        assert!(backend.modified("SaveGame1_Player").is_some());
    }
}
