//! Pipeline stages composing the fileDB operations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};

use crate::acm::AuthContext;
use crate::fileset::{FileRecord, Fileset, FilesetList};
use crate::pipeline::{map_jsonl_records, write_jsonl_record, Result, Source, Step, Vars};
use crate::vcr::{parse_change_line, ChangeEntry, CommitInfo, GitAdapter};

/// Marker values for the `valid` pipeline variable.
pub const SINCE_VALID: &str = "V";
pub const SINCE_INVALID: &str = "I";

// =============================================================================
// Sources
// =============================================================================

/// Lists every tracked path at `{commit}`, one per line.
pub struct TrackedFilesSource {
    pub vcr: GitAdapter,
    pub repo_path: PathBuf,
}

#[async_trait]
impl Source for TrackedFilesSource {
    async fn open(&self, vars: &Vars, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let commit = vars.get_or_empty("commit");
        self.vcr
            .list_tracked_files(&self.repo_path, commit, out)
            .await?;
        Ok(())
    }
}

/// Lists `--name-status` lines for `{since}..{commit}`, or falls back
/// to the full tracked listing when `{since}` is unknown.
pub struct ChangesSource {
    pub vcr: GitAdapter,
    pub repo_path: PathBuf,
}

#[async_trait]
impl Source for ChangesSource {
    async fn open(&self, vars: &Vars, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let commit = vars.get_or_empty("commit");
        if vars.get_or_empty("valid") == SINCE_VALID {
            let since = vars.get_or_empty("since");
            self.vcr
                .list_changes(&self.repo_path, commit, since, out)
                .await?;
        } else {
            self.vcr
                .list_tracked_files(&self.repo_path, commit, out)
                .await?;
        }
        Ok(())
    }
}

/// Emits the single record for `{path}` through its owning fileset's
/// processor, at the path's own last-modified commit.
pub struct SingleRecordSource {
    pub vcr: GitAdapter,
    pub repo_path: PathBuf,
    pub fileset: Arc<Fileset>,
    pub path: String,
}

#[async_trait]
impl Source for SingleRecordSource {
    async fn open(&self, vars: &Vars, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let commit = vars.get_or_empty("commit");
        let record = self
            .fileset
            .make_file_record(&self.vcr, &self.repo_path, commit, &self.path, true)
            .await?;
        write_jsonl_record(out, &record).await
    }
}

/// Streams `{path}` contents through the owning fileset's processor.
pub struct ContentsSource {
    pub vcr: GitAdapter,
    pub repo_path: PathBuf,
    pub fileset: Arc<Fileset>,
    pub path: String,
    pub base_path: String,
    pub template: String,
}

#[async_trait]
impl Source for ContentsSource {
    fn template(&self) -> Option<String> {
        Some(self.template.clone())
    }

    async fn open(&self, vars: &Vars, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let commit = vars.get_or_empty("commit");
        self.fileset
            .pipe_contents(
                &self.vcr,
                &self.repo_path,
                &self.base_path,
                commit,
                &self.path,
                out,
            )
            .await
    }
}

/// Streams a ZIP archive of a fixed path list at `{commit}`.
pub struct ZipSource {
    pub vcr: GitAdapter,
    pub repo_path: PathBuf,
    pub paths: Vec<String>,
    pub template: String,
}

#[async_trait]
impl Source for ZipSource {
    fn template(&self) -> Option<String> {
        Some(self.template.clone())
    }

    async fn open(&self, vars: &Vars, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let commit = vars.get_or_empty("commit");
        self.vcr
            .zip_files_at_commit(&self.repo_path, commit, &self.paths, out)
            .await?;
        Ok(())
    }
}

/// Streams an already-produced artifact as a pipeline input.
pub struct ArtifactSource {
    pub file: PathBuf,
}

#[async_trait]
impl Source for ArtifactSource {
    async fn open(&self, _vars: &Vars, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let mut file = tokio::fs::File::open(&self.file).await?;
        tokio::io::copy(&mut file, out).await?;
        Ok(())
    }
}

// =============================================================================
// Record construction steps
// =============================================================================

/// Turns tracked-path lines into file records via fileset lookup.
///
/// Paths with no owning fileset are skipped.
pub struct RecordsStep {
    pub vcr: GitAdapter,
    pub repo_path: PathBuf,
    pub filesets: Arc<FilesetList>,
}

impl RecordsStep {
    pub const TEMPLATE: &'static str =
        "internal/{ctx.account}/{ctx.repo}/records-{commit}.jsonl";
}

#[async_trait]
impl Step for RecordsStep {
    fn template(&self) -> Option<String> {
        Some(Self::TEMPLATE.to_string())
    }

    async fn run(
        &self,
        vars: &Vars,
        input: &mut (dyn AsyncBufRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let commit = vars.get_or_empty("commit").to_string();
        let mut lines = input.lines();
        while let Some(path) = lines.next_line().await? {
            if path.is_empty() {
                continue;
            }
            if let Some(fileset) = self.filesets.lookup(&path) {
                let record = fileset
                    .make_file_record(&self.vcr, &self.repo_path, &commit, &path, true)
                    .await?;
                write_jsonl_record(out, &record).await?;
            }
        }
        Ok(())
    }
}

/// Turns change lines into file records, expanding renames and emitting
/// synthetic deletions for paths whose fileset ownership lapsed.
pub struct ChangeRecordsStep {
    pub vcr: GitAdapter,
    pub repo_path: PathBuf,
    /// Fileset list at the current commit.
    pub filesets: Arc<FilesetList>,
    /// Fileset list as of the `since` commit.
    pub since_filesets: Arc<FilesetList>,
}

impl ChangeRecordsStep {
    pub const TEMPLATE: &'static str =
        "internal/{ctx.account}/{ctx.repo}/updates-{commit}-{since}-{valid}.jsonl";

    async fn record_for(&self, vars: &Vars, entry: &ChangeEntry) -> Result<Option<FileRecord>> {
        let commit = vars.get_or_empty("commit");
        match self.filesets.lookup(&entry.path) {
            Some(fileset) => {
                let record = fileset
                    .make_file_record(
                        &self.vcr,
                        &self.repo_path,
                        commit,
                        &entry.path,
                        entry.status.is_active(),
                    )
                    .await?;
                Ok(Some(record))
            }
            None => {
                // Owned under the old fileset list but no longer: tell
                // the client to prune it.
                match self.since_filesets.lookup(&entry.path) {
                    Some(old) => Ok(Some(FileRecord::deleted(
                        &entry.path,
                        old.category(),
                        commit,
                    ))),
                    None => Ok(None),
                }
            }
        }
    }
}

#[async_trait]
impl Step for ChangeRecordsStep {
    fn template(&self) -> Option<String> {
        Some(Self::TEMPLATE.to_string())
    }

    async fn run(
        &self,
        vars: &Vars,
        input: &mut (dyn AsyncBufRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let commit = vars.get_or_empty("commit").to_string();
        let invalid_since = vars.get_or_empty("valid") == SINCE_INVALID;
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            if invalid_since {
                // Full-listing fallback: the line is a tracked path.
                if let Some(fileset) = self.filesets.lookup(&line) {
                    let record = fileset
                        .make_file_record(&self.vcr, &self.repo_path, &commit, &line, true)
                        .await?;
                    write_jsonl_record(out, &record).await?;
                }
                continue;
            }
            for entry in parse_change_line(&line)? {
                if let Some(record) = self.record_for(vars, &entry).await? {
                    write_jsonl_record(out, &record).await?;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// processUpdates
// =============================================================================

/// The shared tail step of every listing pipeline.
///
/// Rewrites each record's commit to the path's last-modified short
/// hash, applies ACM filtering and rewriting, and appends the control
/// records: one `$category` per category carrying its latest commit,
/// one `$acm` group record, one `$commit` per distinct commit, and a
/// `$latest` record naming the listing commit. When the `valid`
/// variable marks an unknown `since`, a `$control reset` record is
/// emitted first.
pub struct ProcessUpdatesStep {
    pub vcr: GitAdapter,
    pub repo_path: PathBuf,
    pub auth: Arc<AuthContext>,
    pub template: String,
}

impl ProcessUpdatesStep {
    pub const LIST_TEMPLATE: &'static str =
        "internal/{ctx.account}/{ctx.repo}/results-{commit}-{ctx.auth.group}.jsonl";
    pub const SINCE_TEMPLATE: &'static str =
        "internal/{ctx.account}/{ctx.repo}/results-{commit}-{since}-{valid}-{ctx.auth.group}.jsonl";
}

#[async_trait]
impl Step for ProcessUpdatesStep {
    fn template(&self) -> Option<String> {
        Some(self.template.clone())
    }

    async fn run(
        &self,
        vars: &Vars,
        input: &mut (dyn AsyncBufRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let listing_commit = vars.get_or_empty("commit").to_string();

        if vars.get_or_empty("valid") == SINCE_INVALID {
            write_jsonl_record(out, &FileRecord::control_reset()).await?;
        }

        // category → (committer time, commit id) of its newest record.
        let mut categories: HashMap<String, (i64, String)> = HashMap::new();
        let mut commits: HashMap<String, CommitInfo> = HashMap::new();

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let mut record: FileRecord = serde_json::from_str(&line)?;
            if record.is_control() {
                write_jsonl_record(out, &record).await?;
                continue;
            }
            let path = match record.path.clone() {
                Some(path) => path,
                None => continue,
            };
            let last = self
                .vcr
                .last_commit_for_file(&self.repo_path, &listing_commit, &path)
                .await?;
            if let Some(info) = &last {
                record.commit = Some(info.id.clone());
            }
            if let Some(kept) = self.auth.filter_and_rewrite(record) {
                // Only surfaced records contribute to the control
                // records; withheld categories must not leak.
                if let Some(info) = last {
                    let entry = categories
                        .entry(kept.category.clone())
                        .or_insert((info.unix_sec, info.id.clone()));
                    if info.unix_sec > entry.0 {
                        *entry = (info.unix_sec, info.id.clone());
                    }
                    commits.entry(info.id.clone()).or_insert(info);
                }
                write_jsonl_record(out, &kept).await?;
            }
        }

        // Control records, in a deterministic order.
        let mut category_names: Vec<&String> = categories.keys().collect();
        category_names.sort_unstable();
        for name in category_names {
            let (_, commit) = &categories[name];
            write_jsonl_record(out, &FileRecord::control_category(name, commit)).await?;
        }

        write_jsonl_record(out, &FileRecord::control_acm(&self.auth.group)).await?;

        let mut infos: Vec<&CommitInfo> = commits.values().collect();
        infos.sort_by(|a, b| (a.unix_sec, &a.id).cmp(&(b.unix_sec, &b.id)));
        for info in infos {
            write_jsonl_record(out, &FileRecord::control_commit(info.clone())).await?;
        }

        write_jsonl_record(out, &FileRecord::control_latest(&listing_commit)).await?;
        Ok(())
    }
}

// =============================================================================
// Reductions
// =============================================================================

/// Keeps only the file records of one category.
pub struct FilterCategoryStep {
    pub category: String,
    pub template: String,
}

#[async_trait]
impl Step for FilterCategoryStep {
    fn template(&self) -> Option<String> {
        Some(self.template.clone())
    }

    async fn run(
        &self,
        _vars: &Vars,
        input: &mut (dyn AsyncBufRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let category = self.category.clone();
        map_jsonl_records(input, out, |record| {
            let category = category.clone();
            async move {
                if !record.is_control() && record.category == category {
                    Ok(Some(record))
                } else {
                    Ok(None)
                }
            }
        })
        .await
    }
}

/// Applies ACM filtering and rewriting to a record stream.
pub struct AcmRecordStep {
    pub auth: Arc<AuthContext>,
    pub template: String,
}

#[async_trait]
impl Step for AcmRecordStep {
    fn template(&self) -> Option<String> {
        Some(self.template.clone())
    }

    async fn run(
        &self,
        _vars: &Vars,
        input: &mut (dyn AsyncBufRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let auth = Arc::clone(&self.auth);
        map_jsonl_records(input, out, |record| {
            let auth = Arc::clone(&auth);
            async move { Ok(auth.filter_and_rewrite(record)) }
        })
        .await
    }
}
