//! Filesystem blob storage.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use jobwire_streams::{StorageError, StorageProvider};

/// Blob store rooted at a local directory.
///
/// Blob paths are relative, slash-separated and may not escape the root.
#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    /// Use `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| StorageError::Io(format!("cannot create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::Io(format!("invalid blob path: {path:?}")));
        }
        Ok(self.root.join(relative))
    }
}

impl StorageProvider for LocalDirStorage {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::Io(format!("cannot create {}: {e}", parent.display())))?;
        }
        fs::write(&target, bytes)
            .map_err(|e| StorageError::Io(format!("cannot write {}: {e}", target.display())))?;
        debug!(path, size = bytes.len(), "blob stored");
        Ok(())
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        fs::read(&target).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            _ => StorageError::Io(format!("cannot read {}: {e}", target.display())),
        })
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(format!("cannot delete {}: {e}", target.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("jobwire-storage-{}", uuid::Uuid::now_v7()))
    }

    #[test]
    fn put_fetch_delete() {
        let root = temp_root();
        let storage = LocalDirStorage::new(&root).unwrap();

        storage.put("p/s/j/output/blob.json", b"{\"big\":true}").unwrap();
        assert_eq!(storage.fetch("p/s/j/output/blob.json").unwrap(), b"{\"big\":true}");
        assert!(root.join("p/s/j/output/blob.json").exists());

        storage.delete("p/s/j/output/blob.json").unwrap();
        storage.delete("p/s/j/output/blob.json").unwrap();
        assert!(matches!(
            storage.fetch("p/s/j/output/blob.json"),
            Err(StorageError::NotFound(_))
        ));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn paths_cannot_escape_the_root() {
        let root = temp_root();
        let storage = LocalDirStorage::new(&root).unwrap();

        for bad in ["../outside", "/etc/passwd", "a/../../b", ""] {
            assert!(storage.put(bad, b"x").is_err(), "{bad:?} accepted");
        }

        let _ = fs::remove_dir_all(root);
    }
}
