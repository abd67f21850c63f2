//! Blob storage for offloaded stream payloads.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("storage io error: {0}")]
    Io(String),

    #[error("no storage provider configured to resolve blob {0}")]
    Unavailable(String),
}

/// Byte store addressed by slash-separated paths.
pub trait StorageProvider: Send + Sync {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn fetch(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Remove a blob. Removing a missing blob is not an error.
    fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// In-memory blob store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageProvider for InMemoryStorage {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| StorageError::Io("lock poisoned".to_string()))?;
        blobs.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| StorageError::Io("lock poisoned".to_string()))?;
        blobs
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| StorageError::Io("lock poisoned".to_string()))?;
        blobs.remove(path);
        Ok(())
    }
}
