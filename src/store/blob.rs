use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::store::models::DocumentId;
use crate::utils::error::ApiError;

/// Semantic contract for the object store the ingestion pipeline writes raw
/// uploads, generated markdown and extracted assets to. A real deployment
/// would point this at MinIO or S3; the object-path-keyed contract is all
/// that is in scope here, so a local filesystem tree implements it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), ApiError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, ApiError>;
    async fn exists(&self, path: &str) -> bool;
    async fn delete(&self, path: &str) -> Result<(), ApiError>;
    /// Modification time, used by the ingestion queue to decide whether a
    /// previously generated markdown artifact can be reused.
    async fn modified_at(&self, path: &str) -> Option<std::time::SystemTime>;
}

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), ApiError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ApiError::InternalError(format!("blob store mkdir: {e}")))?;
        }
        let mut file = fs::File::create(&full)
            .await
            .map_err(|e| ApiError::InternalError(format!("blob store create: {e}")))?;
        file.write_all(bytes)
            .await
            .map_err(|e| ApiError::InternalError(format!("blob store write: {e}")))?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        fs::read(self.resolve(path))
            .await
            .map_err(|e| ApiError::NotFound(format!("blob {path} not found: {e}")))
    }

    async fn exists(&self, path: &str) -> bool {
        fs::metadata(self.resolve(path)).await.is_ok()
    }

    async fn delete(&self, path: &str) -> Result<(), ApiError> {
        match fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ApiError::InternalError(format!("blob store delete: {e}"))),
        }
    }

    async fn modified_at(&self, path: &str) -> Option<std::time::SystemTime> {
        fs::metadata(self.resolve(path)).await.ok()?.modified().ok()
    }
}

pub fn asset_path(document_id: DocumentId, file_name: &str) -> String {
    format!("documents/{document_id}/assets/{file_name}")
}

pub fn markdown_path(document_id: DocumentId) -> String {
    format!("documents/{document_id}/content.md")
}

pub fn raw_upload_path(document_id: DocumentId, original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    format!("documents/{document_id}/original.{ext}")
}
