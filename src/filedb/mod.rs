//! The file database: composed pipelines over repository content.
//!
//! Every public operation materializes a disk artifact through the
//! pipeline runtime: full listings, `since` deltas, fileset record
//! lists and ZIP archives, single file records, and file contents. The
//! file-info DB caches a per-branch map of path → last-modified commit
//! for existence checks and etags. All public operations run inside a
//! bounded worker pool so file-descriptor use stays capped under load.

mod stages;

pub use stages::{SINCE_INVALID, SINCE_VALID};

use std::collections::HashMap;
use std::sync::Arc;

use crate::acm::AuthContext;
use crate::context::RequestContext;
use crate::fileset::{FileRecord, FilesetCache};
use crate::negotiator::mime_for_path;
use crate::pipeline::{
    read_jsonl_records, Artifact, PipelineError, PipelineRuntime, Result, Vars,
};
use crate::util::{fingerprint, CachingDedup, CachingDedupConfig, WorkerPool};
use crate::vcr::{CommitInfo, GitAdapter};

use stages::{
    AcmRecordStep, ArtifactSource, ChangeRecordsStep, ChangesSource, ContentsSource,
    FilterCategoryStep, ProcessUpdatesStep, RecordsStep, SingleRecordSource, TrackedFilesSource,
    ZipSource,
};

/// Concurrency bound for public fileDB operations.
const WORKER_POOL_SIZE: usize = 100;

/// One entry of the per-branch file-info DB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Short hash of the last commit that modified the path.
    pub commit: String,
    pub cache_control: Option<String>,
}

pub type FileInfoMap = HashMap<String, FileInfo>;

/// The composed file database for all branches.
pub struct FileDb {
    vcr: GitAdapter,
    runtime: Arc<PipelineRuntime>,
    filesets: Arc<FilesetCache>,
    info: CachingDedup<String, Arc<FileInfoMap>, PipelineError>,
    pool: WorkerPool,
}

impl FileDb {
    pub fn new(
        vcr: GitAdapter,
        runtime: Arc<PipelineRuntime>,
        filesets: Arc<FilesetCache>,
    ) -> Self {
        Self {
            vcr,
            runtime,
            filesets,
            info: CachingDedup::new(CachingDedupConfig { capacity: 256 }),
            pool: WorkerPool::new(WORKER_POOL_SIZE),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn auth(ctx: &RequestContext) -> Result<Arc<AuthContext>> {
        ctx.auth
            .clone()
            .ok_or_else(|| PipelineError::InvalidArgument("context lacks auth".to_string()))
    }

    async fn resolve_commit(
        &self,
        ctx: &RequestContext,
        commit: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(commit) = commit {
            return Ok(Some(commit.to_string()));
        }
        Ok(self
            .vcr
            .head_commit(&ctx.repo_path, &ctx.branch)
            .await?
            .map(|info| info.id))
    }

    async fn fileset_list(
        &self,
        ctx: &RequestContext,
        version: &str,
    ) -> Result<Arc<crate::fileset::FilesetList>> {
        self.filesets
            .list(&ctx.repo_path, &ctx.branch, version)
            .await
            .map_err(|e| PipelineError::Other(e.to_string()))
    }

    fn commit_path(commit: &str) -> String {
        if commit.len() > 2 {
            format!("{}/{}", &commit[..2], &commit[2..])
        } else {
            commit.to_string()
        }
    }

    // =========================================================================
    // Listings
    // =========================================================================

    /// Full listing of file records at `commit` (default: branch head).
    pub async fn list_all_files(
        &self,
        ctx: &RequestContext,
        commit: Option<&str>,
    ) -> Result<Option<Artifact>> {
        self.pool.run(|| self.list_all_inner(ctx, commit)).await
    }

    async fn list_all_inner(
        &self,
        ctx: &RequestContext,
        commit: Option<&str>,
    ) -> Result<Option<Artifact>> {
        let auth = Self::auth(ctx)?;
        let commit = match self.resolve_commit(ctx, commit).await? {
            Some(commit) => commit,
            None => return Ok(None),
        };
        let filesets = self.fileset_list(ctx, &commit).await?;

        let mut vars = ctx.vars();
        vars.set("commit", &commit);

        let source = TrackedFilesSource {
            vcr: self.vcr.clone(),
            repo_path: ctx.repo_path.clone(),
        };
        let records = RecordsStep {
            vcr: self.vcr.clone(),
            repo_path: ctx.repo_path.clone(),
            filesets,
        };
        let process = ProcessUpdatesStep {
            vcr: self.vcr.clone(),
            repo_path: ctx.repo_path.clone(),
            auth,
            template: ProcessUpdatesStep::LIST_TEMPLATE.to_string(),
        };

        self.runtime
            .run(&vars, &source, &[&records, &process])
            .await
            .map(Some)
    }

    /// Records changed since `since`, at `commit` (default: branch
    /// head). An unknown `since` falls back to the full listing with a
    /// leading reset control record.
    pub async fn list_updates_since(
        &self,
        ctx: &RequestContext,
        since: &str,
        commit: Option<&str>,
    ) -> Result<Option<Artifact>> {
        self.pool
            .run(|| self.list_updates_inner(ctx, since, commit))
            .await
    }

    async fn list_updates_inner(
        &self,
        ctx: &RequestContext,
        since: &str,
        commit: Option<&str>,
    ) -> Result<Option<Artifact>> {
        if since.is_empty() {
            return Err(PipelineError::InvalidArgument("empty since".to_string()));
        }
        let auth = Self::auth(ctx)?;
        let commit = match self.resolve_commit(ctx, commit).await? {
            Some(commit) => commit,
            None => return Ok(None),
        };
        let valid = if self.vcr.is_valid_commit(&ctx.repo_path, since).await? {
            SINCE_VALID
        } else {
            SINCE_INVALID
        };

        let current = self.fileset_list(ctx, &commit).await?;
        let since_version = if valid == SINCE_VALID {
            since
        } else {
            commit.as_str()
        };
        let since_filesets = self.fileset_list(ctx, since_version).await?;

        let mut vars = ctx.vars();
        vars.set("commit", &commit)
            .set("since", since)
            .set("valid", valid);

        let source = ChangesSource {
            vcr: self.vcr.clone(),
            repo_path: ctx.repo_path.clone(),
        };
        let records = ChangeRecordsStep {
            vcr: self.vcr.clone(),
            repo_path: ctx.repo_path.clone(),
            filesets: current,
            since_filesets,
        };
        let process = ProcessUpdatesStep {
            vcr: self.vcr.clone(),
            repo_path: ctx.repo_path.clone(),
            auth,
            template: ProcessUpdatesStep::SINCE_TEMPLATE.to_string(),
        };

        self.runtime
            .run(&vars, &source, &[&records, &process])
            .await
            .map(Some)
    }

    // =========================================================================
    // Fileset operations
    // =========================================================================

    async fn listing_for(
        &self,
        ctx: &RequestContext,
        since: Option<&str>,
    ) -> Result<Option<(Artifact, Vars)>> {
        let artifact = match since {
            Some(since) => self.list_updates_inner(ctx, since, None).await?,
            None => self.list_all_inner(ctx, None).await?,
        };
        let artifact = match artifact {
            Some(artifact) => artifact,
            None => return Ok(None),
        };
        let mut vars = ctx.vars();
        vars.set("commit", &artifact.commit);
        if let Some(since) = since {
            let valid = if self.vcr.is_valid_commit(&ctx.repo_path, since).await? {
                SINCE_VALID
            } else {
                SINCE_INVALID
            };
            vars.set("since", since).set("valid", valid);
            vars.set("sinceTag", format!("{since}-{valid}"));
        } else {
            vars.set("sinceTag", "all");
        }
        Ok(Some((artifact, vars)))
    }

    /// The record listing of one fileset, optionally reduced to changes
    /// since `since`.
    pub async fn get_fileset_records(
        &self,
        ctx: &RequestContext,
        category: &str,
        since: Option<&str>,
    ) -> Result<Option<Artifact>> {
        self.pool
            .run(|| async {
                Self::require_category(category)?;
                let (listing, mut vars) = match self.listing_for(ctx, since).await? {
                    Some(found) => found,
                    None => return Ok(None),
                };
                self.require_known_category(ctx, &vars, category).await?;
                vars.set("category", category);

                let source = ArtifactSource {
                    file: listing.file.clone(),
                };
                let filter = FilterCategoryStep {
                    category: category.to_string(),
                    template: "internal/{ctx.account}/{ctx.repo}/fileset-records-{category}-\
                               {commit}-{sinceTag}-{ctx.auth.group}.jsonl"
                        .to_string(),
                };
                self.runtime.run(&vars, &source, &[&filter]).await.map(Some)
            })
            .await
    }

    /// A ZIP archive of one fileset's published files, optionally only
    /// those changed since `since`.
    pub async fn get_fileset_contents(
        &self,
        ctx: &RequestContext,
        category: &str,
        since: Option<&str>,
    ) -> Result<Option<Artifact>> {
        self.pool
            .run(|| async {
                Self::require_category(category)?;
                let (listing, mut vars) = match self.listing_for(ctx, since).await? {
                    Some(found) => found,
                    None => return Ok(None),
                };
                let filesets = self.require_known_category(ctx, &vars, category).await?;
                vars.set("category", category);

                let mut records = {
                    let mut file = tokio::io::BufReader::new(listing.open().await?);
                    read_jsonl_records(&mut file).await?
                };
                records.retain(|r| !r.is_control() && r.category == category && !r.is_deleted());
                let mut paths: Vec<String> =
                    records.into_iter().filter_map(|r| r.path).collect();
                paths.sort_unstable();

                let source = ZipSource {
                    vcr: self.vcr.clone(),
                    repo_path: ctx.repo_path.clone(),
                    paths,
                    template: "internal/{ctx.account}/{ctx.repo}/fileset-{category}-{commit}-\
                               {sinceTag}-group-{ctx.auth.group}.zip"
                        .to_string(),
                };
                let mut artifact = self.runtime.run(&vars, &source, &[]).await?;
                artifact.mime_type = Some("application/zip".to_string());
                artifact.cache_control = filesets
                    .by_category(category)
                    .and_then(|fs| fs.def.cache_control.clone());
                Ok(Some(artifact))
            })
            .await
    }

    fn require_category(category: &str) -> Result<()> {
        if category.is_empty() {
            return Err(PipelineError::InvalidArgument("empty category".to_string()));
        }
        Ok(())
    }

    async fn require_known_category(
        &self,
        ctx: &RequestContext,
        vars: &Vars,
        category: &str,
    ) -> Result<Arc<crate::fileset::FilesetList>> {
        let version = vars.get_or_empty("commit").to_string();
        let filesets = self.fileset_list(ctx, &version).await?;
        if filesets.by_category(category).is_none() {
            return Err(PipelineError::InvalidArgument(format!(
                "unknown fileset '{category}'"
            )));
        }
        Ok(filesets)
    }

    // =========================================================================
    // Single-file operations
    // =========================================================================

    /// The JSON record of one file, or `None` when the path is unknown
    /// or withheld by ACM.
    pub async fn get_file_record(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<Option<Artifact>> {
        self.pool
            .run(|| async {
                let auth = Self::auth(ctx)?;
                let entry = match self.file_info(ctx).await?.get(path).cloned() {
                    Some(entry) => entry,
                    None => return Ok(None),
                };
                let filesets = self.fileset_list(ctx, &entry.commit).await?;
                let fileset = match filesets.lookup(path) {
                    Some(fileset) => Arc::clone(fileset),
                    None => return Ok(None),
                };

                let mut vars = ctx.vars();
                vars.set("commit", &entry.commit)
                    .set("commitPath", Self::commit_path(&entry.commit))
                    .set("pathHash", fingerprint(path));

                let source = SingleRecordSource {
                    vcr: self.vcr.clone(),
                    repo_path: ctx.repo_path.clone(),
                    fileset,
                    path: path.to_string(),
                };
                let acm = AcmRecordStep {
                    auth,
                    template: "internal/{ctx.account}/{ctx.repo}/records/{commitPath}-\
                               {pathHash}-{ctx.auth.group}.json"
                        .to_string(),
                };
                let artifact = self.runtime.run(&vars, &source, &[&acm]).await?;

                // ACM may have withheld the record, leaving the
                // artifact empty: that is the not-found sentinel.
                let meta = tokio::fs::metadata(&artifact.file).await?;
                if meta.len() == 0 {
                    return Ok(None);
                }
                Ok(Some(artifact))
            })
            .await
    }

    /// The contents of one file, or `None` when the path is unknown or
    /// its fileset is not accessible to this request.
    pub async fn get_file_contents(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<Option<Artifact>> {
        self.pool
            .run(|| async {
                let auth = Self::auth(ctx)?;
                let entry = match self.file_info(ctx).await?.get(path).cloned() {
                    Some(entry) => entry,
                    None => return Ok(None),
                };
                let filesets = self.fileset_list(ctx, &entry.commit).await?;
                let fileset = match filesets.lookup(path) {
                    Some(fileset) => Arc::clone(fileset),
                    None => return Ok(None),
                };

                // Same gate the record stream applies.
                let probe = FileRecord::published(path, fileset.category(), &entry.commit);
                if !auth.accessible.contains(fileset.category()) || !auth.filter(&probe) {
                    return Ok(None);
                }

                let mut vars = ctx.vars();
                vars.set("commit", &entry.commit)
                    .set("commitPath", Self::commit_path(&entry.commit))
                    .set("pathHash", fingerprint(path));

                let source = ContentsSource {
                    vcr: self.vcr.clone(),
                    repo_path: ctx.repo_path.clone(),
                    fileset: Arc::clone(&fileset),
                    path: path.to_string(),
                    base_path: ctx.base_path.clone(),
                    template: "external/{ctx.hostname}/{ctx.basePath}/{commitPath}/\
                               {pathHash}-{ctx.auth.group}"
                        .to_string(),
                };
                let mut artifact = self.runtime.run(&vars, &source, &[]).await?;
                artifact.mime_type = Some(mime_for_path(path).to_string());
                artifact.cache_control = entry
                    .cache_control
                    .clone()
                    .or_else(|| fileset.def.cache_control.clone());
                Ok(Some(artifact))
            })
            .await
    }

    /// Whether `path` exists on the branch.
    pub async fn exists(&self, ctx: &RequestContext, path: &str) -> Result<bool> {
        Ok(self.file_info(ctx).await?.contains_key(path))
    }

    /// Recent commits on the branch, for the commits endpoint.
    pub async fn list_commits(
        &self,
        ctx: &RequestContext,
        limit: usize,
    ) -> Result<Option<Vec<CommitInfo>>> {
        self.pool
            .run(|| async {
                if self
                    .vcr
                    .head_commit(&ctx.repo_path, &ctx.branch)
                    .await?
                    .is_none()
                {
                    return Ok(None);
                }
                let commits = self
                    .vcr
                    .list_commits(&ctx.repo_path, &ctx.branch, limit)
                    .await?;
                Ok(Some(commits))
            })
            .await
    }

    // =========================================================================
    // File-info DB
    // =========================================================================

    /// The per-branch map of path → last-modified commit and cache
    /// policy. Populated once per key under single-flight; evicted on
    /// repo-update events.
    pub async fn file_info(&self, ctx: &RequestContext) -> Result<Arc<FileInfoMap>> {
        let key = ctx.key.clone();
        self.info
            .run(key, || self.build_file_info(ctx))
            .await
    }

    async fn build_file_info(&self, ctx: &RequestContext) -> Result<Arc<FileInfoMap>> {
        let commit = match self.resolve_commit(ctx, None).await? {
            Some(commit) => commit,
            None => return Ok(Arc::new(FileInfoMap::new())),
        };
        let filesets = self.fileset_list(ctx, &commit).await?;

        let mut vars = ctx.vars();
        vars.set("commit", &commit);

        let source = TrackedFilesSource {
            vcr: self.vcr.clone(),
            repo_path: ctx.repo_path.clone(),
        };
        let records = RecordsStep {
            vcr: self.vcr.clone(),
            repo_path: ctx.repo_path.clone(),
            filesets: Arc::clone(&filesets),
        };
        let artifact = self.runtime.run(&vars, &source, &[&records]).await?;

        let mut reader = tokio::io::BufReader::new(artifact.open().await?);
        let listing = read_jsonl_records(&mut reader).await?;

        let mut map = FileInfoMap::with_capacity(listing.len());
        for record in listing {
            let path = match record.path {
                Some(path) => path,
                None => continue,
            };
            let last = self
                .vcr
                .last_commit_for_file(&ctx.repo_path, &commit, &path)
                .await?;
            let last = match last {
                Some(info) => info.id,
                None => commit.clone(),
            };
            let cache_control = filesets
                .lookup(&path)
                .and_then(|fs| fs.def.cache_control.clone());
            map.insert(
                path,
                FileInfo {
                    commit: last,
                    cache_control,
                },
            );
        }
        Ok(Arc::new(map))
    }

    /// Drop the file-info entry for a request key.
    pub fn invalidate(&self, key: &str) {
        self.info.invalidate(&key.to_string());
    }
}
