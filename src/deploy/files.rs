//! Where upload bytes come from.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::manifest::{Manifest, ManifestEntry};
use crate::types::{CourierError, Result};

/// Supplies file content by manifest path.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// Files under a root directory, addressed by relative path.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read and hash each of `paths` into a manifest for `version`.
    pub async fn build_manifest(&self, version: &str, paths: &[String]) -> Result<Manifest> {
        let mut manifest = Manifest::new(version);
        for path in paths {
            let content = self.read(path).await?;
            let entry = ManifestEntry::from_content(normalize(path), &content);
            debug!(path = %entry.path, size = entry.size, "Added to manifest");
            manifest.add(entry);
        }
        Ok(manifest)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || path.is_empty() {
            return Err(CourierError::Config(format!(
                "path {:?} is not inside {}",
                path,
                self.root.display()
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileSource for DirectorySource {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::read(&full).await?)
    }
}

/// Manifest paths always use forward slashes.
fn normalize(path: &str) -> String {
    path.trim_start_matches("./").replace('\\', "/")
}
