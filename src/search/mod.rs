//! Full-text search: the per-branch indexer and the cached query path.
//!
//! Indexing is incremental: each pass walks the changes between the
//! scope's last-indexed commit and the branch head inside one SQLite
//! transaction, so a failed pass leaves the previous state intact.
//! Passes are serialized on the `indexer` queue; a branch is never
//! indexed concurrently with itself.
//!
//! Queries go through a small pipeline of their own: the term, mode,
//! and path fingerprint the request, the scope's indexed commit stamps
//! the cache file, and a single-flight guard ensures one execution per
//! artifact. A per-branch byte quota evicts old results by access time,
//! sparing files modified within the last minute.

mod db;
mod excerpt;

pub use db::MAX_ROWS;
pub use excerpt::excerpt;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fileset::FilesetCache;
use crate::manifest::ManifestCache;
use crate::util::{fingerprint_parts, Dedup, NamedQueue};
use crate::vcr::{parse_change_line, ChangeEntry, ChangeStatus, GitAdapter};

use db::IndexUpdate;

/// Queue name serializing all indexer passes.
const INDEXER_QUEUE: &str = "indexer";
/// Commit stamp for scopes that have never been indexed.
const NULL_COMMIT: &str = "00000000";
/// Files newer than this are never evicted by the quota sweep.
const EVICTION_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("version control error: {0}")]
    Vcr(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for SearchError {
    fn from(e: std::io::Error) -> Self {
        SearchError::Io(e.to_string())
    }
}

impl From<rusqlite::Error> for SearchError {
    fn from(e: rusqlite::Error) -> Self {
        SearchError::Db(e.to_string())
    }
}

impl From<crate::vcr::VcrError> for SearchError {
    fn from(e: crate::vcr::VcrError) -> Self {
        SearchError::Vcr(e.to_string())
    }
}

impl From<crate::pipeline::PipelineError> for SearchError {
    fn from(e: crate::pipeline::PipelineError) -> Self {
        SearchError::Other(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;

// =============================================================================
// Query types
// =============================================================================

/// Term composition mode, from the `m` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    Any,
    All,
    Exact,
}

impl SearchMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("all") => SearchMode::All,
            Some("exact") => SearchMode::Exact,
            _ => SearchMode::Any,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::Any => "any",
            SearchMode::All => "all",
            SearchMode::Exact => "exact",
        }
    }
}

/// One row streamed to search clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub path: String,
    pub title: String,
    pub category: String,
    pub excerpt: String,
}

/// Handle to a cached query result file.
#[derive(Debug, Clone)]
pub struct QueryArtifact {
    pub file: PathBuf,
    /// Scope commit the results reflect.
    pub commit: String,
    /// Fingerprint of `(term, mode, path)`.
    pub fingerprint: String,
}

impl QueryArtifact {
    /// Read all result rows back from the artifact.
    pub async fn rows(&self) -> Result<Vec<SearchResult>> {
        let bytes = tokio::fs::read(&self.file).await?;
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| SearchError::Other(e.to_string())))
            .collect()
    }
}

/// Search configuration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Root of the per-branch result cache.
    pub cache_dir: PathBuf,
    /// Per-branch result cache quota, in bytes.
    pub quota_bytes: u64,
}

impl SearchConfig {
    pub fn new(db_path: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            db_path,
            cache_dir,
            quota_bytes: 250 * 1024,
        }
    }
}

// =============================================================================
// SearchService
// =============================================================================

pub struct SearchService {
    vcr: GitAdapter,
    manifests: Arc<ManifestCache>,
    filesets: Arc<FilesetCache>,
    queues: Arc<NamedQueue>,
    flights: Dedup<String, QueryArtifact, SearchError>,
    write_conn: Arc<Mutex<Connection>>,
    read_conn: Arc<Mutex<Connection>>,
    config: SearchConfig,
}

impl SearchService {
    pub fn new(
        config: SearchConfig,
        vcr: GitAdapter,
        manifests: Arc<ManifestCache>,
        filesets: Arc<FilesetCache>,
        queues: Arc<NamedQueue>,
    ) -> Result<Self> {
        let write_conn = db::open_writable(&config.db_path)?;
        let read_conn = db::open_readonly(&config.db_path)?;
        Ok(Self {
            vcr,
            manifests,
            filesets,
            queues,
            flights: Dedup::new(),
            write_conn: Arc::new(Mutex::new(write_conn)),
            read_conn: Arc::new(Mutex::new(read_conn)),
            config,
        })
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    /// Run one indexer pass for a branch, serialized on the indexer
    /// queue.
    pub async fn index_branch(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
        repo_path: &Path,
    ) -> Result<()> {
        self.queues
            .run(INDEXER_QUEUE, || {
                self.index_unit(account, repo, branch, repo_path)
            })
            .await
    }

    /// Queue an indexer pass without waiting for it.
    pub fn schedule_index(
        self: &Arc<Self>,
        account: &str,
        repo: &str,
        branch: &str,
        repo_path: &Path,
    ) {
        let service = Arc::clone(self);
        let account = account.to_string();
        let repo = repo.to_string();
        let branch = branch.to_string();
        let repo_path = repo_path.to_path_buf();
        tokio::spawn(async move {
            if let Err(err) = service
                .index_branch(&account, &repo, &branch, &repo_path)
                .await
            {
                log::warn!("index pass failed for {account}/{repo}/{branch}: {err}");
            }
        });
    }

    async fn index_unit(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
        repo_path: &Path,
    ) -> Result<()> {
        let manifest = self
            .manifests
            .load(repo_path, branch)
            .await
            .map_err(|e| SearchError::Other(e.to_string()))?;
        if !manifest.indexed {
            return Ok(());
        }

        let head = match self.vcr.head_commit(repo_path, branch).await? {
            Some(head) => head,
            None => return Ok(()),
        };

        let (scope_id, since) = {
            let conn = Arc::clone(&self.write_conn);
            let (account, repo, branch) =
                (account.to_string(), repo.to_string(), branch.to_string());
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap();
                db::ensure_scope(&conn, &account, &repo, &branch)
            })
            .await
            .map_err(|e| SearchError::Other(e.to_string()))??
        };

        if since.as_deref() == Some(head.id.as_str()) {
            return Ok(());
        }

        let since_valid = match &since {
            Some(since) => self.vcr.is_valid_commit(repo_path, since).await?,
            None => false,
        };
        let reset = since.is_some() && !since_valid;

        let updates = if since_valid {
            self.collect_change_updates(repo_path, branch, since.as_deref().unwrap(), &head.id)
                .await?
        } else {
            self.collect_full_updates(repo_path, branch, &head.id).await?
        };

        let applied = {
            let conn = Arc::clone(&self.write_conn);
            let head_id = head.id.clone();
            tokio::task::spawn_blocking(move || {
                let mut conn = conn.lock().unwrap();
                db::apply_updates(&mut conn, scope_id, reset, &updates, &head_id)
            })
            .await
            .map_err(|e| SearchError::Other(e.to_string()))?
        };
        match applied {
            Ok(()) => {
                log::info!("indexed {account}/{repo}/{branch} at {}", head.id);
                Ok(())
            }
            Err(err) => {
                log::warn!("index pass rolled back for {account}/{repo}/{branch}: {err}");
                Err(err.into())
            }
        }
    }

    async fn collect_full_updates(
        &self,
        repo_path: &Path,
        branch: &str,
        commit: &str,
    ) -> Result<Vec<IndexUpdate>> {
        let mut listing = Vec::new();
        self.vcr
            .list_tracked_files(repo_path, commit, &mut listing)
            .await?;
        let text = String::from_utf8_lossy(&listing).into_owned();
        let entries: Vec<ChangeEntry> = text
            .lines()
            .filter(|l| !l.is_empty())
            .map(|path| ChangeEntry {
                path: path.to_string(),
                status: ChangeStatus::Added,
            })
            .collect();
        self.updates_for_entries(repo_path, branch, commit, entries)
            .await
    }

    async fn collect_change_updates(
        &self,
        repo_path: &Path,
        branch: &str,
        since: &str,
        commit: &str,
    ) -> Result<Vec<IndexUpdate>> {
        let mut listing = Vec::new();
        self.vcr
            .list_changes(repo_path, commit, since, &mut listing)
            .await?;
        let text = String::from_utf8_lossy(&listing).into_owned();
        let mut entries = Vec::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            entries.extend(parse_change_line(line).map_err(SearchError::from)?);
        }
        self.updates_for_entries(repo_path, branch, commit, entries)
            .await
    }

    async fn updates_for_entries(
        &self,
        repo_path: &Path,
        branch: &str,
        commit: &str,
        entries: Vec<ChangeEntry>,
    ) -> Result<Vec<IndexUpdate>> {
        let filesets = self
            .filesets
            .list(repo_path, branch, commit)
            .await
            .map_err(|e| SearchError::Other(e.to_string()))?;

        let mut updates = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.status.is_active() {
                updates.push(IndexUpdate::Delete {
                    id: entry.path.clone(),
                });
                continue;
            }
            let fileset = match filesets.lookup(&entry.path) {
                Some(fileset) if fileset.def.searchable => Arc::clone(fileset),
                // Unowned or unsearchable: make sure no stale row stays.
                _ => {
                    updates.push(IndexUpdate::Delete {
                        id: entry.path.clone(),
                    });
                    continue;
                }
            };
            let record = fileset
                .make_file_record(&self.vcr, repo_path, commit, &entry.path, true)
                .await?;
            if let Some(search) = fileset
                .make_search_record(&self.vcr, repo_path, commit, &record)
                .await?
            {
                updates.push(IndexUpdate::Upsert(search));
            }
        }
        Ok(updates)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Run (or reuse) a search over one branch.
    pub async fn query(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
        term: &str,
        mode: SearchMode,
        path: Option<&str>,
    ) -> Result<QueryArtifact> {
        let term = term.trim().to_lowercase();
        let fingerprint = fingerprint_parts([
            term.as_str(),
            mode.as_str(),
            path.unwrap_or(""),
        ]);

        let commit = {
            let conn = Arc::clone(&self.read_conn);
            let (account, repo, branch) =
                (account.to_string(), repo.to_string(), branch.to_string());
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap();
                db::scope_since(&conn, &account, &repo, &branch)
            })
            .await
            .map_err(|e| SearchError::Other(e.to_string()))??
        }
        .unwrap_or_else(|| NULL_COMMIT.to_string());

        let branch_dir = self.config.cache_dir.join(account).join(repo).join(branch);
        let file = branch_dir.join(format!("{commit}-{fingerprint}.json"));
        let flight_id = file.display().to_string();

        let artifact = QueryArtifact {
            file: file.clone(),
            commit,
            fingerprint,
        };

        self.flights
            .run(flight_id, || async {
                if tokio::fs::try_exists(&artifact.file).await? {
                    return Ok(artifact.clone());
                }
                self.execute_query(account, repo, branch, &term, mode, path, &artifact)
                    .await?;
                self.enforce_quota(&branch_dir).await;
                Ok(artifact.clone())
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_query(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
        term: &str,
        mode: SearchMode,
        path: Option<&str>,
        artifact: &QueryArtifact,
    ) -> Result<()> {
        let (expr, terms) = match_expression(term, mode);

        let rows = if expr.is_empty() {
            Vec::new()
        } else {
            let conn = Arc::clone(&self.read_conn);
            let (account, repo, branch) =
                (account.to_string(), repo.to_string(), branch.to_string());
            let path = path.map(str::to_string);
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap();
                db::query(&conn, &account, &repo, &branch, &expr, path.as_deref())
            })
            .await
            .map_err(|e| SearchError::Other(e.to_string()))??
        };

        if let Some(parent) = artifact.file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = artifact.file.with_extension("json.tmp");
        let mut body = String::new();
        for row in rows {
            let result = SearchResult {
                excerpt: excerpt(&row.content, &terms),
                path: row.path,
                title: row.title,
                category: row.category,
            };
            body.push_str(
                &serde_json::to_string(&result).map_err(|e| SearchError::Other(e.to_string()))?,
            );
            body.push('\n');
        }
        let written: Result<()> = async {
            tokio::fs::write(&temp, body).await?;
            tokio::fs::rename(&temp, &artifact.file).await?;
            Ok(())
        }
        .await;
        if written.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        written
    }

    /// Evict least-recently-accessed result files over the branch
    /// quota, never touching files modified within the grace window.
    async fn enforce_quota(&self, branch_dir: &Path) {
        let quota = self.config.quota_bytes;
        let dir = branch_dir.to_path_buf();
        let _ = tokio::task::spawn_blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => return,
            };
            let now = SystemTime::now();
            let mut files: Vec<(PathBuf, u64, SystemTime, SystemTime)> = entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let meta = e.metadata().ok()?;
                    if !meta.is_file() {
                        return None;
                    }
                    let accessed = meta.accessed().ok()?;
                    let modified = meta.modified().ok()?;
                    Some((e.path(), meta.len(), accessed, modified))
                })
                .collect();

            let mut total: u64 = files.iter().map(|(_, len, _, _)| len).sum();
            if total <= quota {
                return;
            }
            files.sort_by_key(|(_, _, accessed, _)| *accessed);
            for (path, len, _, modified) in files {
                if total <= quota {
                    break;
                }
                let age = now.duration_since(modified).unwrap_or_default();
                if age < EVICTION_GRACE {
                    continue;
                }
                if std::fs::remove_file(&path).is_ok() {
                    total = total.saturating_sub(len);
                }
            }
        })
        .await;
    }

    /// Drop every cached result for a repository.
    pub fn invalidate_results(&self, account: &str, repo: &str) {
        let dir = self.config.cache_dir.join(account).join(repo);
        let _ = std::fs::remove_dir_all(dir);
    }
}

/// Compose the FTS match expression and the highlight terms.
fn match_expression(term: &str, mode: SearchMode) -> (String, Vec<String>) {
    let quote = |word: &str| format!("\"{}\"", word.replace('"', "\"\""));
    match mode {
        SearchMode::Exact => {
            if term.is_empty() {
                (String::new(), vec![])
            } else {
                (quote(term), vec![term.to_string()])
            }
        }
        SearchMode::Any | SearchMode::All => {
            let words: Vec<&str> = term.split_whitespace().collect();
            if words.is_empty() {
                return (String::new(), vec![]);
            }
            let joiner = if mode == SearchMode::All {
                " AND "
            } else {
                " OR "
            };
            let expr = words
                .iter()
                .map(|w| quote(w))
                .collect::<Vec<_>>()
                .join(joiner);
            (expr, words.iter().map(|w| w.to_string()).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    struct Fixture {
        _dirs: (TempDir, TempDir),
        service: Arc<SearchService>,
        repo: PathBuf,
    }

    fn fixture() -> Fixture {
        let content = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let repo = content.path().join("acc/site.git");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "--quiet"]);
        std::fs::write(
            repo.join("guide.html"),
            "<title>Field Guide</title><p>The quick brown fox jumps.</p>",
        )
        .unwrap();
        std::fs::write(repo.join("notes.json"), "{\"title\":\"Notes\",\"body\":\"lazy dogs\"}")
            .unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "content"]);
        git(&repo, &["branch", "-M", "master"]);

        let vcr = GitAdapter::new();
        let manifests = Arc::new(ManifestCache::new(vcr.clone()));
        let filesets = Arc::new(FilesetCache::new(Arc::clone(&manifests)));
        let config = SearchConfig::new(
            state.path().join("search.sqlite"),
            state.path().join("publish_cache/search"),
        );
        let service = Arc::new(
            SearchService::new(config, vcr, manifests, filesets, Arc::new(NamedQueue::new()))
                .unwrap(),
        );

        Fixture {
            _dirs: (content, state),
            service,
            repo,
        }
    }

    async fn index(fixture: &Fixture) {
        fixture
            .service
            .index_branch("acc", "site", "master", &fixture.repo)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn indexes_and_finds_html_content() {
        let fixture = fixture();
        index(&fixture).await;

        let artifact = fixture
            .service
            .query("acc", "site", "master", "fox", SearchMode::Any, None)
            .await
            .unwrap();
        let rows = artifact.rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "guide.html");
        assert_eq!(rows[0].title, "Field Guide");
        assert!(rows[0].excerpt.contains("<em>fox</em>"));
    }

    #[tokio::test]
    async fn modes_compose_terms() {
        let fixture = fixture();
        index(&fixture).await;

        let any = fixture
            .service
            .query("acc", "site", "master", "fox dogs", SearchMode::Any, None)
            .await
            .unwrap();
        assert_eq!(any.rows().await.unwrap().len(), 2);

        let all = fixture
            .service
            .query("acc", "site", "master", "quick fox", SearchMode::All, None)
            .await
            .unwrap();
        let rows = all.rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "guide.html");

        let exact = fixture
            .service
            .query(
                "acc",
                "site",
                "master",
                "quick brown fox",
                SearchMode::Exact,
                None,
            )
            .await
            .unwrap();
        assert_eq!(exact.rows().await.unwrap().len(), 1);

        let missing = fixture
            .service
            .query("acc", "site", "master", "fox dogs", SearchMode::All, None)
            .await
            .unwrap();
        assert!(missing.rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reindex_is_idempotent_and_incremental() {
        let fixture = fixture();
        index(&fixture).await;
        index(&fixture).await;

        let artifact = fixture
            .service
            .query("acc", "site", "master", "fox", SearchMode::Any, None)
            .await
            .unwrap();
        assert_eq!(artifact.rows().await.unwrap().len(), 1);

        // Delete the indexed page; the next pass prunes it.
        std::fs::remove_file(fixture.repo.join("guide.html")).unwrap();
        git(&fixture.repo, &["add", "-A"]);
        git(&fixture.repo, &["commit", "-q", "-m", "remove guide"]);
        index(&fixture).await;

        let artifact = fixture
            .service
            .query("acc", "site", "master", "fox", SearchMode::Any, None)
            .await
            .unwrap();
        assert!(artifact.rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn results_are_cached_by_commit_and_fingerprint() {
        let fixture = fixture();
        index(&fixture).await;

        let first = fixture
            .service
            .query("acc", "site", "master", "Fox", SearchMode::Any, None)
            .await
            .unwrap();
        let second = fixture
            .service
            .query("acc", "site", "master", "fox", SearchMode::Any, None)
            .await
            .unwrap();
        // Terms are lowercased before fingerprinting.
        assert_eq!(first.file, second.file);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(first.file.exists());
    }

    #[tokio::test]
    async fn unindexed_scope_uses_null_commit() {
        let fixture = fixture();
        let artifact = fixture
            .service
            .query("acc", "site", "master", "fox", SearchMode::Any, None)
            .await
            .unwrap();
        assert_eq!(artifact.commit, NULL_COMMIT);
        assert!(artifact.rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_evicts_old_results_but_spares_recent() {
        let fixture = fixture();
        index(&fixture).await;

        let branch_dir = fixture
            .service
            .config
            .cache_dir
            .join("acc/site/master");
        std::fs::create_dir_all(&branch_dir).unwrap();

        // An old oversized file that must be evicted.
        let old = branch_dir.join("00000000-stale.json");
        std::fs::write(&old, vec![b'x'; 300 * 1024]).unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        let times = std::fs::FileTimes::new().set_accessed(past).set_modified(past);
        std::fs::File::options()
            .append(true)
            .open(&old)
            .unwrap()
            .set_times(times)
            .unwrap();

        let artifact = fixture
            .service
            .query("acc", "site", "master", "fox", SearchMode::Any, None)
            .await
            .unwrap();

        assert!(!old.exists(), "stale oversized file survived the sweep");
        assert!(artifact.file.exists(), "fresh result was evicted");
    }

    #[test]
    fn match_expression_shapes() {
        assert_eq!(
            match_expression("a b", SearchMode::Any).0,
            "\"a\" OR \"b\""
        );
        assert_eq!(
            match_expression("a b", SearchMode::All).0,
            "\"a\" AND \"b\""
        );
        assert_eq!(match_expression("a b", SearchMode::Exact).0, "\"a b\"");
        assert_eq!(match_expression("  ", SearchMode::Any).0, "");
    }
}
