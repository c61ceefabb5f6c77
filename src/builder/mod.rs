//! Serialized external builds and the update fan-out they trigger.
//!
//! Build requests (from the post-receive hook listener or the startup
//! scan) run one at a time on the `builder` queue. A unit reloads the
//! repo's branch info, checks the active build profile, runs the
//! external tool with its output teed to `build.log`, records the built
//! commit, and emits the invalidation events every cache subscribes to.
//!
//! Completions persist as a JSON map under the workspace home, which is
//! what lets the startup scan find branches that went stale while the
//! server was down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::branchdb::BranchDb;
use crate::events::{EventBus, RepoUpdate};
use crate::manifest::{ManifestCache, MANIFEST_BRANCH};
use crate::util::NamedQueue;
use crate::vcr::GitAdapter;

/// Queue name serializing all build units.
const BUILDER_QUEUE: &str = "builder";
/// File under the workspace home recording built commits.
const COMPLETIONS_FILE: &str = "builds.json";

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("version control error: {0}")]
    Vcr(#[from] crate::vcr::VcrError),

    #[error("branch db error: {0}")]
    BranchDb(#[from] crate::branchdb::BranchDbError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BuilderError>;

/// Builder configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub workspace_home: PathBuf,
    pub enabled: bool,
    /// Default build command when a profile names none.
    pub default_command: Option<String>,
}

/// The serialized build executor.
pub struct Builder {
    config: BuildConfig,
    branches: Arc<BranchDb>,
    manifests: Arc<ManifestCache>,
    vcr: GitAdapter,
    queues: Arc<NamedQueue>,
    events: Arc<EventBus>,
    /// `account/repo/branch` → last successfully built commit.
    completions: Mutex<HashMap<String, String>>,
}

impl Builder {
    pub fn new(
        config: BuildConfig,
        branches: Arc<BranchDb>,
        manifests: Arc<ManifestCache>,
        vcr: GitAdapter,
        queues: Arc<NamedQueue>,
        events: Arc<EventBus>,
    ) -> Self {
        let completions = Mutex::new(Self::load_completions(&config.workspace_home));
        Self {
            config,
            branches,
            manifests,
            vcr,
            queues,
            events,
            completions,
        }
    }

    fn load_completions(workspace_home: &std::path::Path) -> HashMap<String, String> {
        let path = workspace_home.join(COMPLETIONS_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                log::warn!("corrupt {}: {err}", path.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    fn save_completions(&self) {
        let path = self.config.workspace_home.join(COMPLETIONS_FILE);
        let map = self.completions.lock().unwrap().clone();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(&map) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&path, bytes) {
                    log::warn!("cannot persist build completions: {err}");
                }
            }
            Err(err) => log::warn!("cannot serialize build completions: {err}"),
        }
    }

    /// The last built commit for a key, if any.
    pub fn last_completion(&self, key: &str) -> Option<String> {
        self.completions.lock().unwrap().get(key).cloned()
    }

    fn add_completion(&self, key: &str, commit: &str) {
        self.completions
            .lock()
            .unwrap()
            .insert(key.to_string(), commit.to_string());
        self.save_completions();
    }

    /// Run one build unit on the builder queue.
    pub async fn request_build(&self, account: &str, repo: &str, branch: &str) -> Result<()> {
        self.queues
            .run(BUILDER_QUEUE, || self.build_unit(account, repo, branch))
            .await
    }

    /// Queue a build without waiting for it.
    pub fn schedule_build(self: &Arc<Self>, account: &str, repo: &str, branch: &str) {
        let builder = Arc::clone(self);
        let account = account.to_string();
        let repo = repo.to_string();
        let branch = branch.to_string();
        tokio::spawn(async move {
            if let Err(err) = builder.request_build(&account, &repo, &branch).await {
                log::warn!("build failed for {account}/{repo}/{branch}: {err}");
            }
        });
    }

    async fn build_unit(&self, account: &str, repo: &str, branch: &str) -> Result<()> {
        let event = RepoUpdate::new(account, repo, branch);

        self.branches.update_branch_info(account, repo).await?;
        let entry = match self.branches.get(account, repo) {
            Some(entry) => entry,
            None => return Ok(()),
        };

        let built = self.run_build(account, branch, &event, &entry).await?;
        if built {
            self.events.emit_build(&event);
        }

        // The hook fired because content moved; caches go stale whether
        // or not a build ran.
        self.events.emit_repo_update(&event);
        Ok(())
    }

    async fn run_build(
        &self,
        account: &str,
        branch: &str,
        event: &RepoUpdate,
        entry: &crate::branchdb::RepoEntry,
    ) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }

        let head = match self.vcr.head_commit(&entry.repo_path, branch).await? {
            Some(head) => head,
            None => return Ok(false),
        };
        if self.last_completion(&event.key).as_deref() == Some(head.id.as_str()) {
            log::debug!("{} already built at {}", event.key, head.id);
            return Ok(false);
        }

        let manifest = self
            .manifests
            .load(&entry.repo_path, MANIFEST_BRANCH)
            .await
            .map_err(|e| BuilderError::Other(e.to_string()))?;
        let profile = match self.branches.build_profile(&manifest) {
            Some(profile) => profile,
            None => return Ok(false),
        };
        if !profile.buildable.iter().any(|b| b == branch) {
            return Ok(false);
        }
        let command = match profile.command.or_else(|| self.config.default_command.clone()) {
            Some(command) => command,
            None => {
                log::warn!("no build command for {}", event.key);
                return Ok(false);
            }
        };

        let workspace = self.config.workspace_home.join(account);
        tokio::fs::create_dir_all(&workspace).await?;
        let log_path = workspace.join("build.log");
        let log_file = std::fs::File::options()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_clone = log_file.try_clone()?;

        log::info!("building {} at {}", event.key, head.id);
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&workspace)
            .env("LOCOMOTE_ACCOUNT", account)
            .env("LOCOMOTE_REPO", &entry.repo)
            .env("LOCOMOTE_BRANCH", branch)
            .env("LOCOMOTE_REPO_PATH", &entry.repo_path)
            .env("LOCOMOTE_COMMIT", &head.id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_clone))
            .status()
            .await?;

        if !status.success() {
            log::warn!("build for {} exited with {status}", event.key);
            return Ok(false);
        }

        self.add_completion(&event.key, &head.id);
        Ok(true)
    }

    /// Queue builds for every buildable branch whose head is not the
    /// recorded completion. This is the crash-recovery step.
    pub async fn startup_scan(self: &Arc<Self>) -> Result<()> {
        let mut queued = 0;
        for (entry, branch) in self.branches.list_buildable() {
            let key = format!("{}/{}/{branch}", entry.account, entry.repo);
            let head = self.vcr.head_commit(&entry.repo_path, &branch).await?;
            let head = match head {
                Some(head) => head.id,
                None => continue,
            };
            if self.last_completion(&key).as_deref() != Some(head.as_str()) {
                self.schedule_build(&entry.account, &entry.repo, &branch);
                queued += 1;
            }
        }
        if queued > 0 {
            log::info!("startup scan queued {queued} stale builds");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::BuildProfile;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
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

    struct Fixture {
        _content: TempDir,
        _workspace: TempDir,
        builder: Arc<Builder>,
        events: Arc<EventBus>,
        repo: PathBuf,
        workspace_home: PathBuf,
    }

    async fn fixture(manifest: &str) -> Fixture {
        let content = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let repo = content.path().join("acc/site.git");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "--quiet"]);
        std::fs::write(repo.join("locomote.json"), manifest).unwrap();
        std::fs::write(repo.join("index.html"), "<title>x</title>").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "init"]);
        git(&repo, &["branch", "-M", "master"]);

        let vcr = GitAdapter::new();
        let manifests = Arc::new(ManifestCache::new(vcr.clone()));
        let mut profiles = HashMap::new();
        profiles.insert(
            "www".to_string(),
            BuildProfile {
                buildable: vec!["master".to_string()],
                command: Some("echo built >> marker.txt".to_string()),
            },
        );
        let branches = Arc::new(BranchDb::new(
            content.path().to_path_buf(),
            Arc::clone(&manifests),
            profiles,
        ));
        branches.scan().await.unwrap();

        let events = Arc::new(EventBus::new());
        let builder = Arc::new(Builder::new(
            BuildConfig {
                workspace_home: workspace.path().to_path_buf(),
                enabled: true,
                default_command: None,
            },
            branches,
            manifests,
            vcr,
            Arc::new(NamedQueue::new()),
            Arc::clone(&events),
        ));

        let workspace_home = workspace.path().to_path_buf();
        Fixture {
            _content: content,
            _workspace: workspace,
            builder,
            events,
            repo,
            workspace_home,
        }
    }

    const BUILDABLE: &str = "{\"public\": [\"master\"], \"build\": \"www\"}";

    #[tokio::test]
    async fn successful_build_records_and_emits() {
        let fixture = fixture(BUILDABLE).await;
        let builds = Arc::new(AtomicUsize::new(0));
        let updates = Arc::new(AtomicUsize::new(0));
        {
            let builds = Arc::clone(&builds);
            fixture.events.on_build(move |_| {
                builds.fetch_add(1, Ordering::SeqCst);
            });
            let updates = Arc::clone(&updates);
            fixture.events.on_repo_update(move |_| {
                updates.fetch_add(1, Ordering::SeqCst);
            });
        }

        fixture
            .builder
            .request_build("acc", "site", "master")
            .await
            .unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert!(fixture
            .builder
            .last_completion("acc/site/master")
            .is_some());
        assert!(fixture.workspace_home.join("acc/marker.txt").exists());
        assert!(fixture.workspace_home.join("builds.json").exists());
    }

    #[tokio::test]
    async fn unchanged_head_skips_the_build() {
        let fixture = fixture(BUILDABLE).await;
        let builds = Arc::new(AtomicUsize::new(0));
        {
            let builds = Arc::clone(&builds);
            fixture.events.on_build(move |_| {
                builds.fetch_add(1, Ordering::SeqCst);
            });
        }

        fixture
            .builder
            .request_build("acc", "site", "master")
            .await
            .unwrap();
        fixture
            .builder
            .request_build("acc", "site", "master")
            .await
            .unwrap();

        // Second unit skipped: same head, one build event.
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        let marker = std::fs::read_to_string(fixture.workspace_home.join("acc/marker.txt"))
            .unwrap();
        assert_eq!(marker.lines().count(), 1);
    }

    #[tokio::test]
    async fn non_buildable_branch_still_invalidates() {
        let fixture = fixture("{\"public\": [\"master\"]}").await;
        let builds = Arc::new(AtomicUsize::new(0));
        let updates = Arc::new(AtomicUsize::new(0));
        {
            let builds = Arc::clone(&builds);
            fixture.events.on_build(move |_| {
                builds.fetch_add(1, Ordering::SeqCst);
            });
            let updates = Arc::clone(&updates);
            fixture.events.on_repo_update(move |_| {
                updates.fetch_add(1, Ordering::SeqCst);
            });
        }

        fixture
            .builder
            .request_build("acc", "site", "master")
            .await
            .unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn startup_scan_queues_stale_branches() {
        let fixture = fixture(BUILDABLE).await;
        fixture.builder.startup_scan().await.unwrap();

        // The scheduled build runs asynchronously on the queue.
        for _ in 0..50 {
            if fixture.builder.last_completion("acc/site/master").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(fixture
            .builder
            .last_completion("acc/site/master")
            .is_some());

        // A second scan with nothing stale queues nothing new.
        let marker = std::fs::read_to_string(fixture.workspace_home.join("acc/marker.txt"))
            .unwrap();
        assert_eq!(marker.lines().count(), 1);
        fixture.builder.startup_scan().await.unwrap();
    }

    #[tokio::test]
    async fn failed_build_records_nothing() {
        let content = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let repo = content.path().join("acc/site.git");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "--quiet"]);
        std::fs::write(
            repo.join("locomote.json"),
            "{\"public\": [\"master\"], \
             \"build\": {\"profile\": {\"buildable\": [\"master\"], \"command\": \"exit 3\"}}}",
        )
        .unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "init"]);
        git(&repo, &["branch", "-M", "master"]);

        let vcr = GitAdapter::new();
        let manifests = Arc::new(ManifestCache::new(vcr.clone()));
        let branches = Arc::new(BranchDb::new(
            content.path().to_path_buf(),
            Arc::clone(&manifests),
            HashMap::new(),
        ));
        branches.scan().await.unwrap();
        let events = Arc::new(EventBus::new());
        let builder = Arc::new(Builder::new(
            BuildConfig {
                workspace_home: workspace.path().to_path_buf(),
                enabled: true,
                default_command: None,
            },
            branches,
            manifests,
            vcr,
            Arc::new(NamedQueue::new()),
            events,
        ));

        builder.request_build("acc", "site", "master").await.unwrap();
        assert!(builder.last_completion("acc/site/master").is_none());
    }
}
