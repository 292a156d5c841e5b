//! Object storage collaborator.
//!
//! The orchestrator only needs two things from storage: a URL a site can
//! download an artifact from, and a way to delete the artifact once no
//! deployment needs it any more.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// URL under which `storage_path` is served to sites.
    fn public_url(&self, storage_path: &str) -> String;

    /// Delete a stored object. `Ok(false)` when it was already gone.
    async fn delete(&self, storage_path: &str) -> anyhow::Result<bool>;
}

/// Objects stored as files under a root directory.
pub struct LocalObjectStorage {
    root: PathBuf,
    base_url: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, storage_path: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(storage_path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("storage path escapes the object root: {storage_path}");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    fn public_url(&self, storage_path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            storage_path.trim_start_matches('/')
        )
    }

    async fn delete(&self, storage_path: &str) -> anyhow::Result<bool> {
        let path = self.resolve(storage_path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "stored object deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
