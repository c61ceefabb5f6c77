//! Directory of accounts, repositories, and their branches.
//!
//! Repositories are discovered by walking the content root two levels
//! deep for `{account}/{repo}.git` directories. Each repo's manifest
//! yields its public branches and, through the active build profile,
//! its buildable branches. The directory is rebuilt per repo when a
//! `content-repo-update` event names it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::manifest::{BuildProfile, BuildSpec, Manifest, ManifestCache, ManifestError,
    MANIFEST_BRANCH};

#[derive(Debug, Error)]
pub enum BranchDbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Manifest(#[from] ManifestError),

    #[error("unknown repository {account}/{repo}")]
    UnknownRepo { account: String, repo: String },
}

pub type Result<T> = std::result::Result<T, BranchDbError>;

/// One discovered repository.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoEntry {
    pub account: String,
    pub repo: String,
    pub repo_path: PathBuf,
    pub public: Vec<String>,
    pub buildable: Vec<String>,
}

/// The account/repo/branch directory.
pub struct BranchDb {
    content_root: PathBuf,
    manifests: Arc<ManifestCache>,
    /// Named build profiles from server settings.
    profiles: HashMap<String, BuildProfile>,
    repos: RwLock<HashMap<(String, String), Arc<RepoEntry>>>,
}

impl BranchDb {
    pub fn new(
        content_root: PathBuf,
        manifests: Arc<ManifestCache>,
        profiles: HashMap<String, BuildProfile>,
    ) -> Self {
        Self {
            content_root,
            manifests,
            profiles,
            repos: RwLock::new(HashMap::new()),
        }
    }

    /// `{root}/{account}/{repo}.git`
    pub fn repo_path(&self, account: &str, repo: &str) -> PathBuf {
        self.content_root.join(account).join(format!("{repo}.git"))
    }

    fn buildable_branches(&self, manifest: &Manifest) -> Vec<String> {
        match &manifest.build {
            Some(BuildSpec::Inline(profile)) => profile.buildable.clone(),
            Some(BuildSpec::Profile(id)) => self
                .profiles
                .get(id)
                .map(|p| p.buildable.clone())
                .unwrap_or_default(),
            None => vec![],
        }
    }

    /// The build profile in effect for a repo, if any.
    pub fn build_profile(&self, manifest: &Manifest) -> Option<BuildProfile> {
        match &manifest.build {
            Some(BuildSpec::Inline(profile)) => Some(profile.clone()),
            Some(BuildSpec::Profile(id)) => self.profiles.get(id).cloned(),
            None => None,
        }
    }

    async fn load_entry(&self, account: &str, repo: &str) -> Result<Arc<RepoEntry>> {
        let repo_path = self.repo_path(account, repo);
        let manifest = self.manifests.load(&repo_path, MANIFEST_BRANCH).await?;
        Ok(Arc::new(RepoEntry {
            account: account.to_string(),
            repo: repo.to_string(),
            repo_path,
            public: manifest.public.clone(),
            buildable: self.buildable_branches(&manifest),
        }))
    }

    /// Walk the content root and (re)load every repository.
    pub async fn scan(&self) -> Result<()> {
        let mut found = HashMap::new();
        let mut accounts = match tokio::fs::read_dir(&self.content_root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "content root {} does not exist",
                    self.content_root.display()
                );
                *self.repos.write().unwrap() = found;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        while let Some(account_entry) = accounts.next_entry().await? {
            if !account_entry.file_type().await?.is_dir() {
                continue;
            }
            let account = account_entry.file_name().to_string_lossy().into_owned();
            let mut repos = tokio::fs::read_dir(account_entry.path()).await?;
            while let Some(repo_entry) = repos.next_entry().await? {
                if !repo_entry.file_type().await?.is_dir() {
                    continue;
                }
                let name = repo_entry.file_name().to_string_lossy().into_owned();
                let Some(repo) = name.strip_suffix(".git") else {
                    continue;
                };
                match self.load_entry(&account, repo).await {
                    Ok(entry) => {
                        found.insert((account.clone(), repo.to_string()), entry);
                    }
                    Err(err) => {
                        log::warn!("skipping {account}/{repo}: {err}");
                    }
                }
            }
        }

        log::info!("branch db loaded {} repositories", found.len());
        *self.repos.write().unwrap() = found;
        Ok(())
    }

    /// Reload one repository's branch info from its manifest.
    pub async fn update_branch_info(&self, account: &str, repo: &str) -> Result<()> {
        let repo_path = self.repo_path(account, repo);
        self.manifests.invalidate_repo(&repo_path);
        if !tokio::fs::try_exists(&repo_path).await? {
            self.repos
                .write()
                .unwrap()
                .remove(&(account.to_string(), repo.to_string()));
            return Ok(());
        }
        let entry = self.load_entry(account, repo).await?;
        self.repos
            .write()
            .unwrap()
            .insert((account.to_string(), repo.to_string()), entry);
        Ok(())
    }

    pub fn get(&self, account: &str, repo: &str) -> Option<Arc<RepoEntry>> {
        self.repos
            .read()
            .unwrap()
            .get(&(account.to_string(), repo.to_string()))
            .cloned()
    }

    pub fn is_account_name(&self, name: &str) -> bool {
        self.repos.read().unwrap().keys().any(|(a, _)| a == name)
    }

    pub fn is_repo_name(&self, account: &str, repo: &str) -> bool {
        self.get(account, repo).is_some()
    }

    /// First public branch of the repo, if any.
    pub fn default_public_branch(&self, account: &str, repo: &str) -> Option<String> {
        self.get(account, repo)?.public.first().cloned()
    }

    pub fn is_public_branch(&self, account: &str, repo: &str, branch: &str) -> bool {
        self.get(account, repo)
            .is_some_and(|entry| entry.public.iter().any(|b| b == branch))
    }

    /// The repo's default repository within an account: the repo named
    /// like the account, else `site`, else nothing.
    pub fn default_repo(&self, account: &str) -> Option<String> {
        for candidate in [account, "site"] {
            if self.is_repo_name(account, candidate) {
                return Some(candidate.to_string());
            }
        }
        None
    }

    /// Every `(repo, branch)` pair that is public.
    pub fn list_public(&self) -> Vec<(Arc<RepoEntry>, String)> {
        let repos = self.repos.read().unwrap();
        let mut pairs = Vec::new();
        for entry in repos.values() {
            for branch in &entry.public {
                pairs.push((Arc::clone(entry), branch.clone()));
            }
        }
        pairs
    }

    /// Every `(repo, branch)` pair that is buildable.
    pub fn list_buildable(&self) -> Vec<(Arc<RepoEntry>, String)> {
        let repos = self.repos.read().unwrap();
        let mut pairs = Vec::new();
        for entry in repos.values() {
            for branch in &entry.buildable {
                pairs.push((Arc::clone(entry), branch.clone()));
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcr::GitAdapter;
    use std::process::Stdio;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=t", "-c", "user.email=t@example.com"])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());
    }

    fn make_repo(root: &Path, account: &str, repo: &str, manifest: Option<&str>) {
        let path = root.join(account).join(format!("{repo}.git"));
        std::fs::create_dir_all(&path).unwrap();
        git(&path, &["init", "--quiet"]);
        let content = manifest.unwrap_or("{\"public\": [\"master\"]}");
        std::fs::write(path.join("locomote.json"), content).unwrap();
        std::fs::write(path.join("index.html"), "<title>x</title>").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-q", "-m", "init"]);
        git(&path, &["branch", "-M", "master"]);
    }

    fn branch_db(root: &Path) -> BranchDb {
        let manifests = Arc::new(ManifestCache::new(GitAdapter::new()));
        let mut profiles = HashMap::new();
        profiles.insert(
            "www".to_string(),
            BuildProfile {
                buildable: vec!["master".to_string()],
                command: Some("make".to_string()),
            },
        );
        BranchDb::new(root.to_path_buf(), manifests, profiles)
    }

    #[tokio::test]
    async fn discovers_repos_two_levels_deep() {
        let root = TempDir::new().unwrap();
        make_repo(root.path(), "acme", "site", None);
        make_repo(root.path(), "other", "docs", None);

        let db = branch_db(root.path());
        db.scan().await.unwrap();

        assert!(db.is_account_name("acme"));
        assert!(db.is_repo_name("acme", "site"));
        assert!(!db.is_repo_name("acme", "docs"));
        assert_eq!(
            db.default_public_branch("other", "docs"),
            Some("master".to_string())
        );
        assert!(db.is_public_branch("acme", "site", "master"));
        assert!(!db.is_public_branch("acme", "site", "wip"));
    }

    #[tokio::test]
    async fn buildable_comes_from_named_profile() {
        let root = TempDir::new().unwrap();
        make_repo(
            root.path(),
            "acme",
            "site",
            Some("{\"public\": [\"master\"], \"build\": \"www\"}"),
        );

        let db = branch_db(root.path());
        db.scan().await.unwrap();

        let buildable = db.list_buildable();
        assert_eq!(buildable.len(), 1);
        assert_eq!(buildable[0].1, "master");
    }

    #[tokio::test]
    async fn inline_profile_wins() {
        let root = TempDir::new().unwrap();
        make_repo(
            root.path(),
            "acme",
            "site",
            Some(
                "{\"public\": [\"master\"], \
                 \"build\": {\"profile\": {\"buildable\": [\"master\", \"beta\"]}}}",
            ),
        );

        let db = branch_db(root.path());
        db.scan().await.unwrap();
        let entry = db.get("acme", "site").unwrap();
        assert_eq!(entry.buildable, vec!["master", "beta"]);
    }

    #[tokio::test]
    async fn update_branch_info_reloads_one_repo() {
        let root = TempDir::new().unwrap();
        make_repo(root.path(), "acme", "site", None);

        let db = branch_db(root.path());
        db.scan().await.unwrap();
        assert!(db.is_public_branch("acme", "site", "master"));

        // Change the manifest on disk and commit.
        let repo = root.path().join("acme/site.git");
        std::fs::write(
            repo.join("locomote.json"),
            "{\"public\": [\"master\", \"beta\"]}",
        )
        .unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "manifest"]);

        db.update_branch_info("acme", "site").await.unwrap();
        assert!(db.is_public_branch("acme", "site", "beta"));
    }

    #[tokio::test]
    async fn missing_content_root_is_empty() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("nope");
        let db = branch_db(&missing);
        db.scan().await.unwrap();
        assert!(db.list_public().is_empty());
    }
}
