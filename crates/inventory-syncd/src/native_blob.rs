//! Native blob store: one file per key under a directory, via tokio::fs.

use async_trait::async_trait;
use inventory_sync::blob::{BlobError, BlobStore, Result};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

/// Blob store for the daemon's bookkeeping (tombstones, checkpoints, ...).
pub struct NativeBlobStore {
    base_path: PathBuf,
}

impl NativeBlobStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl BlobStore for NativeBlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_path = self.full_path(key)?;
        match fs::read(&full_path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Io(e.to_string())),
        }
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(key)?;
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))?;

        // Write then rename so readers never see a torn blob
        let tmp_path = self.base_path.join(format!(".{key}.tmp"));
        fs::write(&tmp_path, content)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))?;
        fs::rename(&tmp_path, &full_path)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e.to_string())),
        }
    }
}
