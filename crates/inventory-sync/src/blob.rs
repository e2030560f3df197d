//! BlobStore trait abstraction for small persisted key-value blobs.
//!
//! Engine bookkeeping (tombstones, pending relationships, checkpoints) lives
//! here rather than in the object store, so it survives independently.
//!
//! Implementations:
//! - `InMemoryBlobStore` - For testing
//! - `NativeBlobStore` (in inventory-syncd) - One file per key via tokio::fs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, BlobError>;

/// Persisted key-value blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob; `None` if it was never written.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a blob atomically.
    async fn write(&self, key: &str, content: &[u8]) -> Result<()>;

    /// Remove a blob. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory blob store for testing
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    /// When set, every write fails (for testing persistence errors)
    fail_writes: RwLock<bool>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.write().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Raw contents of a blob, for inspecting persisted layouts in tests.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        if *self.fail_writes.read().unwrap_or_else(|e| e.into_inner()) {
            return Err(BlobError::Io(format!("write to {key} refused")));
        }
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), content.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

// Implement BlobStore for Arc<T> where T: BlobStore
// This allows tests to keep a handle on the store they hand to the engine
#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for std::sync::Arc<T> {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).read(key).await
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        (**self).write(key, content).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}
