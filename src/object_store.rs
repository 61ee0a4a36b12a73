//! Object storage for generated assets.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload_file(&self, category: &str, key: &str, bytes: &[u8]) -> Result<()>;

    fn public_url(&self, category: &str, key: &str) -> String;

    /// Deleting a missing object is not an error.
    async fn delete(&self, category: &str, key: &str) -> Result<()>;
}

/// Objects stored as files under `root/<category>/<key>`.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, category: &str, key: &str) -> Result<PathBuf> {
        let rel = Path::new(category).join(key);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid object key: {}/{}", category, key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload_file(&self, category: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(category, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    fn public_url(&self, category: &str, key: &str) -> String {
        format!("file://{}/{}/{}", self.root.display(), category, key)
    }

    async fn delete(&self, category: &str, key: &str) -> Result<()> {
        let path = self.object_path(category, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_and_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.upload_file("images", "a/b.png", b"png").await.unwrap();
        assert!(dir.path().join("images/a/b.png").exists());
        store.delete("images", "a/b.png").await.unwrap();
        store.delete("images", "a/b.png").await.unwrap();
        assert!(!dir.path().join("images/a/b.png").exists());
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store.upload_file("x", "../escape", b"").await.is_err());
    }
}
