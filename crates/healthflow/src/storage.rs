//! Blob storage for uploaded originals.
//!
//! [`FsBlobStorage`] keeps files under a configured root as
//! `{owner_id}/{uuid}-{sanitized filename}`. Storage paths are relative to
//! the root and never contain `..`, so a stored path cannot escape it.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use healthflow_core::error::{CoreError, CoreResult};

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `bytes` and return the storage path.
    async fn put(
        &self,
        owner_id: &str,
        file_name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> CoreResult<String>;

    async fn get(&self, path: &str) -> CoreResult<Vec<u8>>;

    /// Remove a blob. Deleting a missing blob is not an error.
    async fn delete(&self, path: &str) -> CoreResult<()>;
}

pub struct FsBlobStorage {
    root: PathBuf,
}

impl FsBlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> CoreResult<PathBuf> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(CoreError::Validation(format!(
                "invalid storage path: {}",
                path
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStorage for FsBlobStorage {
    async fn put(
        &self,
        owner_id: &str,
        file_name: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> CoreResult<String> {
        let owner_dir = sanitize_filename(owner_id);
        let path = format!(
            "{}/{}-{}",
            owner_dir,
            Uuid::new_v4(),
            sanitize_filename(file_name)
        );
        let full = self.resolve(&path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Storage(e.into()))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| CoreError::Storage(e.into()))?;
        tracing::debug!(path = %path, size = bytes.len(), "blob stored");
        Ok(path)
    }

    async fn get(&self, path: &str) -> CoreResult<Vec<u8>> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoreError::not_found("blob")),
            Err(e) => Err(CoreError::Storage(e.into())),
        }
    }

    async fn delete(&self, path: &str) -> CoreResult<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Storage(e.into())),
        }
    }
}

/// Strip path separators and special characters from a file name.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|&c| c != '/' && c != '\\' && c != '\0')
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let sanitized = sanitized.replace("..", "");
    let sanitized: String = sanitized.chars().take(100).collect();

    if sanitized.is_empty() || sanitized == "." {
        "document".into()
    } else {
        sanitized
    }
}
