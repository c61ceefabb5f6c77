//! Per-repository auth settings and their cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::fileset::{FilesetCache, FilesetList};
use crate::manifest::ManifestCache;
use crate::util::{fingerprint_json, CachingDedup, CachingDedupConfig};

use super::authenticate::{authenticate, AuthUser};
use super::derived::{derive, RequestAuthInput};
use super::{AcmError, AuthContext, Result};

/// One entry of the basic-auth user table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub password: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// The manifest's `auth` object.
#[derive(Debug, Clone, Deserialize, Default)]
struct RawAuthConfig {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    realm: Option<String>,
    #[serde(default)]
    users: HashMap<String, UserEntry>,
}

/// Server-wide auth defaults, from configuration.
#[derive(Debug, Clone)]
pub struct AuthDefaults {
    pub method: String,
    pub realm: String,
}

impl Default for AuthDefaults {
    fn default() -> Self {
        Self {
            method: "basic".to_string(),
            realm: "Locomote".to_string(),
        }
    }
}

/// Resolved auth settings for one `account/repo/branch`.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub method: String,
    pub realm: String,
    pub users: HashMap<String, UserEntry>,
    pub filesets: Arc<FilesetList>,
    /// Category → deterministic fingerprint of its definition.
    pub fingerprints: HashMap<String, String>,
    /// Category → named rewriter from the fileset's `acm` field.
    pub rewrites: HashMap<String, String>,
    /// Commit hash of the manifest these settings came from.
    pub fingerprint: String,
}

impl AuthSettings {
    fn assemble(
        defaults: &AuthDefaults,
        raw: RawAuthConfig,
        filesets: Arc<FilesetList>,
        fingerprint: String,
    ) -> Self {
        let mut fingerprints = HashMap::new();
        let mut rewrites = HashMap::new();
        for fileset in filesets.iter() {
            let category = fileset.category().to_string();
            if let Ok(fp) = fingerprint_json(&fileset.def) {
                fingerprints.insert(category.clone(), fp);
            }
            if let Some(rewriter) = &fileset.def.acm {
                rewrites.insert(category.clone(), rewriter.clone());
            }
        }

        Self {
            method: raw.method.unwrap_or_else(|| defaults.method.clone()),
            realm: raw.realm.unwrap_or_else(|| defaults.realm.clone()),
            users: raw.users,
            filesets,
            fingerprints,
            rewrites,
            fingerprint,
        }
    }

    /// Categories every request may see.
    pub fn unrestricted_categories(&self) -> HashSet<String> {
        self.filesets
            .iter()
            .filter(|fs| !fs.def.restricted)
            .map(|fs| fs.category().to_string())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn build_for_test(filesets: Arc<FilesetList>) -> Self {
        Self::assemble(
            &AuthDefaults::default(),
            RawAuthConfig::default(),
            filesets,
            "testfp".to_string(),
        )
    }
}

// =============================================================================
// SettingsCache
// =============================================================================

/// Builds and caches [`AuthSettings`] by request key.
pub struct SettingsCache {
    defaults: AuthDefaults,
    manifests: Arc<ManifestCache>,
    filesets: Arc<FilesetCache>,
    cache: CachingDedup<String, Arc<AuthSettings>, AcmError>,
}

impl SettingsCache {
    pub fn new(
        defaults: AuthDefaults,
        manifests: Arc<ManifestCache>,
        filesets: Arc<FilesetCache>,
    ) -> Self {
        Self {
            defaults,
            manifests,
            filesets,
            cache: CachingDedup::new(CachingDedupConfig { capacity: 512 }),
        }
    }

    /// Auth settings for the request's repo and branch.
    pub async fn get(&self, ctx: &RequestContext) -> Result<Arc<AuthSettings>> {
        let defaults = self.defaults.clone();
        let manifests = Arc::clone(&self.manifests);
        let filesets = Arc::clone(&self.filesets);
        let repo_path = ctx.repo_path.clone();
        let branch = ctx.branch.clone();
        self.cache
            .run(ctx.key.clone(), || async move {
                let manifest = manifests
                    .load(&repo_path, &branch)
                    .await
                    .map_err(|e| AcmError::Settings(e.to_string()))?;
                let list = filesets
                    .list(&repo_path, &branch, &manifest.fingerprint)
                    .await
                    .map_err(|e| AcmError::Settings(e.to_string()))?;
                let raw: RawAuthConfig = match &manifest.auth {
                    Some(value) => serde_json::from_value(value.clone())
                        .map_err(|e| AcmError::Settings(e.to_string()))?,
                    None => RawAuthConfig::default(),
                };
                Ok(Arc::new(AuthSettings::assemble(
                    &defaults,
                    raw,
                    list,
                    manifest.fingerprint.clone(),
                )))
            })
            .await
    }

    /// Authenticate a request and assemble its [`AuthContext`].
    pub async fn build_context(
        &self,
        ctx: &RequestContext,
        input: &RequestAuthInput,
    ) -> Result<Arc<AuthContext>> {
        let settings = self.get(ctx).await?;
        let user: AuthUser =
            authenticate(&settings, ctx.secure, input.authorization.as_deref())?;
        let derived = derive(input)?;
        Ok(Arc::new(AuthContext::build(settings, user, derived)))
    }

    /// Drop cached settings for one request key.
    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(&key.to_string());
    }
}
