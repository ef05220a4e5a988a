//! Filesystem backend, for development and single-host deployments.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::{public_url, ObjectStorage, StorageError};

/// Writes objects below a base directory, mirroring the key layout.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_dir: PathBuf,
    public_base_url: String,
}

impl LocalStorage {
    pub fn new(base_dir: impl Into<PathBuf>, public_base_url: String) -> Self {
        Self {
            base_dir: base_dir.into(),
            public_base_url,
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let path = self.base_dir.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "Wrote object");
        Ok(public_url(&self.public_base_url, key))
    }
}
