//! Object store abstraction for documents (§4.A). Binary blob storage itself
//! is delegated to whatever backs production (S3-compatible, in this case) —
//! this module implements the contract against the local filesystem, which
//! is sufficient for the broker's own persistence needs and for tests.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::error::{StorageError, StorageResult};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, mime: &str) -> StorageResult<()>;
    async fn get(&self, key: &str) -> StorageResult<Option<(Vec<u8>, String)>>;
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

#[derive(Clone)]
pub struct FsObjectStore {
    root: std::path::PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn data_path(&self, key: &str) -> std::path::PathBuf {
        self.root.join(sanitize_key(key))
    }

    fn mime_path(&self, key: &str) -> std::path::PathBuf {
        self.root.join(format!("{}.mime", sanitize_key(key)))
    }
}

fn sanitize_key(key: &str) -> String {
    key.trim_start_matches('/').replace("..", "_")
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, mime: &str) -> StorageResult<()> {
        let data_path = self.data_path(key);
        if let Some(parent) = data_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Transient(e.to_string()))?;
        }
        let mut file = tokio::fs::File::create(&data_path)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        tokio::fs::write(self.mime_path(key), mime.as_bytes())
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<(Vec<u8>, String)>> {
        let data_path = self.data_path(key);
        match tokio::fs::read(&data_path).await {
            Ok(bytes) => {
                let mime = tokio::fs::read_to_string(self.mime_path(key))
                    .await
                    .unwrap_or_else(|_| "application/octet-stream".to_string());
                Ok(Some((bytes, mime)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Transient(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let data_path = self.data_path(key);
        match tokio::fs::remove_file(&data_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Transient(e.to_string())),
        }
        let _ = tokio::fs::remove_file(self.mime_path(key)).await;
        Ok(())
    }
}
