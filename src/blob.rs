//! Blob store port — file storage internals are opaque to ingestion.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BlobError;

/// Result of persisting one blob.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// Opaque key for later retrieval.
    pub key: String,
    /// Resolvable URL for display surfaces.
    pub url: String,
    pub size_bytes: i64,
}

/// Opaque blob store, per the collaborator contract
/// `save(file, pathPrefix) -> {url, key, size}` / `resolveUrl(key)`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save(
        &self,
        data: &[u8],
        path_prefix: &str,
        filename: &str,
    ) -> Result<StoredBlob, BlobError>;

    fn resolve_url(&self, key: &str) -> String;
}

/// Local-filesystem blob store for development and tests.
pub struct LocalBlobStore {
    root: std::path::PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn save(
        &self,
        data: &[u8],
        path_prefix: &str,
        filename: &str,
    ) -> Result<StoredBlob, BlobError> {
        // Key layout: <prefix>/<uuid>-<filename>; the uuid guards against
        // colliding filenames within one message.
        let key = format!("{path_prefix}/{}-{filename}", Uuid::new_v4());
        let path = self.root.join(&key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Upload {
                    name: filename.to_string(),
                    reason: e.to_string(),
                })?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| BlobError::Upload {
                name: filename.to_string(),
                reason: e.to_string(),
            })?;

        Ok(StoredBlob {
            url: self.resolve_url(&key),
            key,
            size_bytes: data.len() as i64,
        })
    }

    fn resolve_url(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}
