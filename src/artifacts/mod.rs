//! Fetching test scripts and data files referenced by plans and collections.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DataError;

/// Object store holding uploaded artifacts, addressed by `filepath`.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(&self, filepath: &str) -> Result<Bytes, DataError>;
}

/// Artifacts stored under a local directory.
#[derive(Debug, Clone)]
pub struct LocalArtifacts {
    root: PathBuf,
}

impl LocalArtifacts {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, filepath: &str) -> Result<PathBuf, DataError> {
        let relative = Path::new(filepath);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes || filepath.is_empty() {
            return Err(DataError::ArtifactPathEscapes {
                path: filepath.to_owned(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactSource for LocalArtifacts {
    async fn fetch(&self, filepath: &str) -> Result<Bytes, DataError> {
        let path = self.resolve(filepath)?;
        let content = tokio::fs::read(&path)
            .await
            .map_err(|err| DataError::ArtifactRead { path, source: err })?;
        tracing::debug!("Fetched artifact {} ({} bytes)", filepath, content.len());
        Ok(Bytes::from(content))
    }
}
