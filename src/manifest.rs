//! Repository manifests (`locomote.json`).
//!
//! The manifest file lives on the master branch and configures a repo's
//! public branches, build profile, auth settings, and fileset
//! definitions. Values may be symbolic links: an object of the form
//! `{"$ref": "#/pointer/with/$SOURCE"}` is replaced by the referenced
//! subtree of the same document, with `$SOURCE` substituted by the
//! branch being resolved. That lets one manifest give each branch its
//! own view.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fileset::FilesetDef;
use crate::util::{CachingDedup, CachingDedupConfig};
use crate::vcr::GitAdapter;

/// Branch the manifest file is read from.
pub const MANIFEST_BRANCH: &str = "master";
/// Manifest file name at the repository root.
pub const MANIFEST_FILE: &str = "locomote.json";
/// Fingerprint used when a repo has no manifest history.
pub const NULL_FINGERPRINT: &str = "00000000";

/// Bound on chained `$ref` substitutions.
const MAX_REF_DEPTH: usize = 16;

#[derive(Debug, Clone, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("version control error: {0}")]
    Vcr(String),

    #[error("malformed manifest in {repo}: {message}")]
    Malformed { repo: String, message: String },

    #[error("unresolvable $ref '{0}'")]
    BadRef(String),
}

impl From<crate::vcr::VcrError> for ManifestError {
    fn from(e: crate::vcr::VcrError) -> Self {
        ManifestError::Vcr(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ManifestError>;

// =============================================================================
// Manifest Model
// =============================================================================

/// An inline build profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BuildProfile {
    /// Branches this profile will build.
    #[serde(default)]
    pub buildable: Vec<String>,
    /// Command line for the external build tool.
    #[serde(default)]
    pub command: Option<String>,
}

/// The manifest's build configuration: a named profile from server
/// settings, or an inline profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildSpec {
    Profile(String),
    Inline(BuildProfile),
}

/// Raw manifest wire shape; `public` accepts a string or a list.
#[derive(Debug, Clone, Deserialize, Default)]
struct RawManifest {
    #[serde(default)]
    public: Option<serde_json::Value>,
    #[serde(default)]
    build: Option<RawBuild>,
    #[serde(default)]
    auth: Option<serde_json::Value>,
    #[serde(default)]
    indexed: Option<bool>,
    #[serde(default)]
    filesets: Option<Vec<FilesetDef>>,
}

/// `build` accepts `{profile: …}` or, as a compatibility shim, a bare
/// profile id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawBuild {
    Shim(String),
    Keyed { profile: BuildSpec },
}

/// A resolved manifest for one branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub public: Vec<String>,
    pub build: Option<BuildSpec>,
    pub auth: Option<serde_json::Value>,
    pub indexed: bool,
    pub filesets: Option<Vec<FilesetDef>>,
    /// Short hash of the commit that last modified the manifest.
    pub fingerprint: String,
}

impl Default for Manifest {
    /// The manifest assumed when a repo has no `locomote.json`.
    fn default() -> Self {
        Self {
            public: vec!["public".to_string()],
            build: None,
            auth: None,
            indexed: true,
            filesets: None,
            fingerprint: NULL_FINGERPRINT.to_string(),
        }
    }
}

// =============================================================================
// $ref Resolution
// =============================================================================

/// Resolve `$ref` links in `value` against `root`, substituting
/// `$SOURCE` with `branch` in each pointer.
fn resolve_refs(
    value: &serde_json::Value,
    root: &serde_json::Value,
    branch: &str,
    depth: usize,
) -> Result<serde_json::Value> {
    if depth > MAX_REF_DEPTH {
        return Err(ManifestError::BadRef("$ref chain too deep".to_string()));
    }

    match value {
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                if let Some(serde_json::Value::String(reference)) = map.get("$ref") {
                    let pointer = reference
                        .split_once('#')
                        .map(|(_, fragment)| fragment)
                        .unwrap_or(reference)
                        .replace("$SOURCE", branch);
                    let target = root
                        .pointer(&pointer)
                        .ok_or_else(|| ManifestError::BadRef(reference.clone()))?;
                    return resolve_refs(target, root, branch, depth + 1);
                }
            }
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                resolved.insert(key.clone(), resolve_refs(val, root, branch, depth + 1)?);
            }
            Ok(serde_json::Value::Object(resolved))
        }
        serde_json::Value::Array(items) => Ok(serde_json::Value::Array(
            items
                .iter()
                .map(|v| resolve_refs(v, root, branch, depth + 1))
                .collect::<Result<Vec<_>>>()?,
        )),
        other => Ok(other.clone()),
    }
}

fn string_or_list(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::String(s) => vec![s.clone()],
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => vec![],
    }
}

/// Parse and resolve manifest JSON for `branch`.
fn parse_manifest(
    raw_json: &[u8],
    branch: &str,
    repo: &str,
    fingerprint: String,
) -> Result<Manifest> {
    let root: serde_json::Value =
        serde_json::from_slice(raw_json).map_err(|e| ManifestError::Malformed {
            repo: repo.to_string(),
            message: e.to_string(),
        })?;
    let resolved = resolve_refs(&root, &root, branch, 0)?;
    let raw: RawManifest =
        serde_json::from_value(resolved).map_err(|e| ManifestError::Malformed {
            repo: repo.to_string(),
            message: e.to_string(),
        })?;

    Ok(Manifest {
        public: raw
            .public
            .as_ref()
            .map(string_or_list)
            .unwrap_or_else(|| Manifest::default().public),
        build: raw.build.map(|b| match b {
            RawBuild::Shim(id) => BuildSpec::Profile(id),
            RawBuild::Keyed { profile } => profile,
        }),
        auth: raw.auth,
        indexed: raw.indexed.unwrap_or(true),
        filesets: raw.filesets,
        fingerprint,
    })
}

// =============================================================================
// ManifestCache
// =============================================================================

/// Loads and caches manifests by `(repo_path, branch)`.
pub struct ManifestCache {
    vcr: GitAdapter,
    cache: CachingDedup<String, Arc<Manifest>, ManifestError>,
}

impl ManifestCache {
    pub fn new(vcr: GitAdapter) -> Self {
        Self {
            vcr,
            cache: CachingDedup::new(CachingDedupConfig { capacity: 512 }),
        }
    }

    fn key(repo_path: &Path, branch: &str) -> String {
        format!("{}|{branch}", repo_path.display())
    }

    /// The manifest of `repo_path` resolved for `branch`.
    pub async fn load(&self, repo_path: &Path, branch: &str) -> Result<Arc<Manifest>> {
        let key = Self::key(repo_path, branch);
        let vcr = self.vcr.clone();
        let repo_path = repo_path.to_path_buf();
        let branch = branch.to_string();
        self.cache
            .run(key, || async move { Self::load_fresh(&vcr, &repo_path, &branch).await })
            .await
    }

    async fn load_fresh(vcr: &GitAdapter, repo_path: &Path, branch: &str) -> Result<Arc<Manifest>> {
        let head = match vcr.head_commit(repo_path, MANIFEST_BRANCH).await? {
            Some(head) => head,
            None => return Ok(Arc::new(Manifest::default())),
        };
        let bytes = match vcr
            .read_file_at_commit(repo_path, &head.id, MANIFEST_FILE)
            .await?
        {
            Some(bytes) => bytes,
            None => return Ok(Arc::new(Manifest::default())),
        };
        let fingerprint = vcr
            .last_commit_for_file(repo_path, MANIFEST_BRANCH, MANIFEST_FILE)
            .await?
            .map(|c| c.id)
            .unwrap_or_else(|| NULL_FINGERPRINT.to_string());

        let repo = repo_path.display().to_string();
        parse_manifest(&bytes, branch, &repo, fingerprint).map(Arc::new)
    }

    /// The manifest as of `version` (a commit on the content branch).
    ///
    /// Repositories that track their manifest on the branch get true
    /// historical resolution; otherwise this falls back to the current
    /// master-branch manifest.
    pub async fn load_at(
        &self,
        repo_path: &Path,
        branch: &str,
        version: &str,
    ) -> Result<Arc<Manifest>> {
        let key = format!("{}|{branch}@{version}", repo_path.display());
        let vcr = self.vcr.clone();
        let repo_path_owned = repo_path.to_path_buf();
        let branch_owned = branch.to_string();
        let version = version.to_string();
        self.cache
            .run(key, || async move {
                match vcr
                    .read_file_at_commit(&repo_path_owned, &version, MANIFEST_FILE)
                    .await
                {
                    Ok(Some(bytes)) => {
                        let repo = repo_path_owned.display().to_string();
                        parse_manifest(&bytes, &branch_owned, &repo, version).map(Arc::new)
                    }
                    _ => Self::load_fresh(&vcr, &repo_path_owned, &branch_owned).await,
                }
            })
            .await
    }

    /// Drop every cached manifest for one repository.
    pub fn invalidate_repo(&self, repo_path: &Path) {
        let prefix = format!("{}|", repo_path.display());
        self.cache.invalidate_where(|key| key.starts_with(&prefix));
    }
}
