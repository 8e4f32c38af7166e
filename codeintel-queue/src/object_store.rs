//! Durable storage for raw uploads and processed bundles.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("upload {0} not found")]
    UploadNotFound(i64),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Raw (gzip-compressed) upload payload.
    async fn get_upload(&self, upload_id: i64) -> Result<Vec<u8>, ObjectStoreError>;

    /// Remove the raw upload. Missing uploads are not an error.
    async fn delete_upload(&self, upload_id: i64) -> Result<(), ObjectStoreError>;

    /// Copy a finished bundle from local scratch space into durable storage.
    async fn put_bundle(&self, upload_id: i64, path: &Path) -> Result<(), ObjectStoreError>;
}

/// Object store rooted at a local directory:
/// `<root>/uploads/<id>.gz` and `<root>/bundles/<id>.bundle`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn upload_path(&self, upload_id: i64) -> PathBuf {
        self.root.join("uploads").join(format!("{upload_id}.gz"))
    }

    pub fn bundle_path(&self, upload_id: i64) -> PathBuf {
        self.root.join("bundles").join(format!("{upload_id}.bundle"))
    }

    /// Store a raw upload, as the upload endpoint would.
    pub async fn put_upload(&self, upload_id: i64, data: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.upload_path(upload_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get_upload(&self, upload_id: i64) -> Result<Vec<u8>, ObjectStoreError> {
        match tokio::fs::read(self.upload_path(upload_id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ObjectStoreError::UploadNotFound(upload_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_upload(&self, upload_id: i64) -> Result<(), ObjectStoreError> {
        match tokio::fs::remove_file(self.upload_path(upload_id)).await {
            Ok(()) => {
                debug!("Deleted upload {}", upload_id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_bundle(&self, upload_id: i64, path: &Path) -> Result<(), ObjectStoreError> {
        let target = self.bundle_path(upload_id);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());

        assert!(matches!(
            store.get_upload(1).await,
            Err(ObjectStoreError::UploadNotFound(1))
        ));

        store.put_upload(1, b"payload").await.unwrap();
        assert_eq!(store.get_upload(1).await.unwrap(), b"payload");

        store.delete_upload(1).await.unwrap();
        store.delete_upload(1).await.unwrap();
        assert!(store.get_upload(1).await.is_err());
    }

    #[tokio::test]
    async fn test_put_bundle_copies_file() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path().join("objects"));
        let scratch = dir.path().join("bundle");
        std::fs::write(&scratch, b"bundle").unwrap();

        store.put_bundle(3, &scratch).await.unwrap();
        assert_eq!(std::fs::read(store.bundle_path(3)).unwrap(), b"bundle");
    }
}
