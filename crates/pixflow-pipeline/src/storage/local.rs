use super::{ObjectStore, PutOptions, StorageError};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use url::Url;

/// Object store backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        _options: PutOptions,
    ) -> Result<String, StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;

        let absolute = std::path::absolute(&path)?;
        let url = Url::from_file_path(&absolute)
            .map_err(|_| StorageError::InvalidKey(key.to_string()))?;

        debug!(key, path = %path.display(), "Stored object locally");
        Ok(url.to_string())
    }
}
