//! Cached, compiled fileset lists per branch.

use std::path::Path;
use std::sync::Arc;

use crate::manifest::{ManifestCache, ManifestError};
use crate::util::{CachingDedup, CachingDedupConfig};

use super::{default_filesets, FilesetList};

#[derive(Debug, Clone, thiserror::Error)]
pub enum FilesetCacheError {
    #[error("{0}")]
    Manifest(#[from] ManifestError),

    #[error("bad fileset glob: {0}")]
    Glob(String),
}

/// Materializes the fileset list for a branch, caching by `(repo,
/// branch, version)` so repeated lookups within one listing pass reuse
/// the compiled matchers.
pub struct FilesetCache {
    manifests: Arc<ManifestCache>,
    cache: CachingDedup<String, Arc<FilesetList>, FilesetCacheError>,
}

impl FilesetCache {
    pub fn new(manifests: Arc<ManifestCache>) -> Self {
        Self {
            manifests,
            cache: CachingDedup::new(CachingDedupConfig { capacity: 256 }),
        }
    }

    /// The fileset list for `branch` of the repo at `repo_path`, as of
    /// `version`.
    pub async fn list(
        &self,
        repo_path: &Path,
        branch: &str,
        version: &str,
    ) -> Result<Arc<FilesetList>, FilesetCacheError> {
        let key = format!("{}|{branch}|{version}", repo_path.display());
        let manifests = Arc::clone(&self.manifests);
        let repo_path = repo_path.to_path_buf();
        let branch = branch.to_string();
        let version = version.to_string();
        self.cache
            .run(key, || async move {
                let manifest = manifests.load_at(&repo_path, &branch, &version).await?;
                let defs = manifest
                    .filesets
                    .clone()
                    .unwrap_or_else(default_filesets);
                FilesetList::compile(defs)
                    .map(Arc::new)
                    .map_err(|e| FilesetCacheError::Glob(e.to_string()))
            })
            .await
    }

    /// Drop cached lists for one repository.
    pub fn invalidate_repo(&self, repo_path: &Path) {
        let prefix = format!("{}|", repo_path.display());
        self.cache.invalidate_where(|key| key.starts_with(&prefix));
    }
}
