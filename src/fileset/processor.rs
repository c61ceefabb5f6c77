//! Per-category record and content processing.
//!
//! The processor decides what a fileset's paths look like as file
//! records, how their bytes are piped to clients, and what the search
//! indexer sees. All three follow the processor kind declared on the
//! fileset definition.

use std::path::Path;

use tokio::io::{AsyncWrite, BufReader};

use crate::pipeline::{PipelineError, Result};
use crate::vcr::GitAdapter;

use super::html::{extract_page_meta, relocate_html, text_content};
use super::record::FileRecord;
use super::{Fileset, ProcessorKind};

/// A row handed to the search indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRecord {
    /// Stable id within the scope; the path serves.
    pub id: String,
    pub path: String,
    pub title: String,
    pub content: String,
    pub category: String,
}

impl Fileset {
    /// Build the file record for `path` at `version`.
    ///
    /// `active` distinguishes published paths from deletions; deleted
    /// records never carry processor fields, so no content is read.
    pub async fn make_file_record(
        &self,
        vcr: &GitAdapter,
        repo_path: &Path,
        version: &str,
        path: &str,
        active: bool,
    ) -> Result<FileRecord> {
        if !active {
            return Ok(FileRecord::deleted(path, self.category(), version));
        }

        let mut record = FileRecord::published(path, self.category(), version);
        match self.def.processor {
            ProcessorKind::Raw => {}
            ProcessorKind::HtmlRewrite => {
                if let Some(bytes) = vcr.read_file_at_commit(repo_path, version, path).await? {
                    let html = String::from_utf8_lossy(&bytes);
                    record.page = Some(extract_page_meta(&html));
                }
            }
            ProcessorKind::JsonParse => {
                if let Some(bytes) = vcr.read_file_at_commit(repo_path, version, path).await? {
                    match serde_json::from_slice(&bytes) {
                        Ok(value) => record.data = Some(value),
                        Err(err) => {
                            // A malformed data file is published bare
                            // rather than poisoning the whole listing.
                            log::warn!("unparseable JSON at {version}:{path}: {err}");
                        }
                    }
                }
            }
        }
        Ok(record)
    }

    /// Stream the contents of `path` at `commit` into `out`.
    ///
    /// The html-rewrite processor relocates absolute URLs against the
    /// request's base path while streaming; other processors pipe
    /// verbatim.
    pub async fn pipe_contents(
        &self,
        vcr: &GitAdapter,
        repo_path: &Path,
        base_path: &str,
        commit: &str,
        path: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let relocate = self.def.processor == ProcessorKind::HtmlRewrite
            && Path::new(path)
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("html"));

        if !relocate {
            vcr.pipe_file_at_commit(repo_path, commit, path, out).await?;
            return Ok(());
        }

        // Pipe through the relocator without buffering the document: the
        // git stdout feeds one side of a duplex, the rewriter drains it.
        let (reader, mut writer) = tokio::io::duplex(32 * 1024);
        let vcr = vcr.clone();
        let repo_path = repo_path.to_path_buf();
        let commit = commit.to_string();
        let path = path.to_string();
        let producer = tokio::spawn(async move {
            vcr.pipe_file_at_commit(&repo_path, &commit, &path, &mut writer)
                .await
        });

        let mut reader = BufReader::new(reader);
        relocate_html(base_path, &mut reader, out).await?;
        producer
            .await
            .map_err(|e| PipelineError::Other(e.to_string()))??;
        Ok(())
    }

    /// The search row for a published record, or `None` when there is
    /// nothing indexable.
    pub async fn make_search_record(
        &self,
        vcr: &GitAdapter,
        repo_path: &Path,
        commit: &str,
        record: &FileRecord,
    ) -> Result<Option<SearchRecord>> {
        let path = match record.path.as_deref() {
            Some(path) => path,
            None => return Ok(None),
        };

        let (title, content) = match self.def.processor {
            ProcessorKind::HtmlRewrite => {
                let bytes = match vcr.read_file_at_commit(repo_path, commit, path).await? {
                    Some(bytes) => bytes,
                    None => return Ok(None),
                };
                let html = String::from_utf8_lossy(&bytes).into_owned();
                let title = record
                    .page
                    .as_ref()
                    .and_then(|p| p.get("title"))
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| basename(path));
                (title, text_content(&html))
            }
            ProcessorKind::JsonParse => {
                let data = match &record.data {
                    Some(data) => data.clone(),
                    None => match vcr.read_file_at_commit(repo_path, commit, path).await? {
                        Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
                        None => return Ok(None),
                    },
                };
                let title = data
                    .get("title")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| basename(path));
                (title, flatten_strings(&data))
            }
            ProcessorKind::Raw => (basename(path), String::new()),
        };

        Ok(Some(SearchRecord {
            id: path.to_string(),
            path: path.to_string(),
            title,
            content,
            category: self.category().to_string(),
        }))
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// All string leaves of a JSON value, joined for full-text indexing.
fn flatten_strings(value: &serde_json::Value) -> String {
    fn walk(value: &serde_json::Value, out: &mut Vec<String>) {
        match value {
            serde_json::Value::String(s) => out.push(s.clone()),
            serde_json::Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            serde_json::Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    walk(value, &mut parts);
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::super::{default_filesets, FilesetList};
    use super::*;
    use std::fs;
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

    async fn fixture() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "--quiet"]);
        fs::write(
            dir.path().join("page.html"),
            "<title>A Page</title><a href=\"/other.html\">go</a>",
        )
        .unwrap();
        fs::write(dir.path().join("thing.json"), "{\"title\":\"Thing\",\"body\":\"text\"}")
            .unwrap();
        fs::write(dir.path().join("raw.bin"), b"\x00\x01").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "content"]);
        git(dir.path(), &["branch", "-M", "master"]);
        let head = GitAdapter::new()
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();
        (dir, head.id)
    }

    fn filesets() -> FilesetList {
        FilesetList::compile(default_filesets()).unwrap()
    }

    #[tokio::test]
    async fn html_record_carries_page_meta() {
        let (dir, commit) = fixture().await;
        let list = filesets();
        let fileset = list.lookup("page.html").unwrap();

        let record = fileset
            .make_file_record(&GitAdapter::new(), dir.path(), &commit, "page.html", true)
            .await
            .unwrap();
        assert_eq!(record.category, "pages");
        let page = record.page.unwrap();
        assert_eq!(page["title"], "A Page");
    }

    #[tokio::test]
    async fn json_record_embeds_parsed_data() {
        let (dir, commit) = fixture().await;
        let list = filesets();
        let fileset = list.lookup("thing.json").unwrap();

        let record = fileset
            .make_file_record(&GitAdapter::new(), dir.path(), &commit, "thing.json", true)
            .await
            .unwrap();
        assert_eq!(record.data.unwrap()["title"], "Thing");
    }

    #[tokio::test]
    async fn deleted_records_skip_content_reads() {
        let (dir, commit) = fixture().await;
        let list = filesets();
        let fileset = list.lookup("page.html").unwrap();

        let record = fileset
            .make_file_record(&GitAdapter::new(), dir.path(), &commit, "gone.html", false)
            .await
            .unwrap();
        assert!(record.is_deleted());
        assert!(record.page.is_none());
    }

    #[tokio::test]
    async fn pipe_contents_relocates_html() {
        let (dir, commit) = fixture().await;
        let list = filesets();
        let fileset = list.lookup("page.html").unwrap();

        let mut out = Vec::new();
        fileset
            .pipe_contents(
                &GitAdapter::new(),
                dir.path(),
                "/acc/site",
                &commit,
                "page.html",
                &mut out,
            )
            .await
            .unwrap();
        let html = String::from_utf8(out).unwrap();
        assert!(html.contains("href=\"/acc/site/other.html\""));
    }

    #[tokio::test]
    async fn pipe_contents_raw_is_verbatim() {
        let (dir, commit) = fixture().await;
        let list = filesets();
        let fileset = list.lookup("raw.bin").unwrap();

        let mut out = Vec::new();
        fileset
            .pipe_contents(&GitAdapter::new(), dir.path(), "/base", &commit, "raw.bin", &mut out)
            .await
            .unwrap();
        assert_eq!(out, vec![0u8, 1u8]);
    }

    #[tokio::test]
    async fn search_record_extracts_text() {
        let (dir, commit) = fixture().await;
        let list = filesets();
        let fileset = list.lookup("page.html").unwrap();
        let record = fileset
            .make_file_record(&GitAdapter::new(), dir.path(), &commit, "page.html", true)
            .await
            .unwrap();

        let search = fileset
            .make_search_record(&GitAdapter::new(), dir.path(), &commit, &record)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(search.title, "A Page");
        assert!(search.content.contains("go"));
        assert_eq!(search.category, "pages");
    }

    #[test]
    fn flatten_strings_walks_nested_values() {
        let value = serde_json::json!({"a": "one", "b": {"c": ["two", 3]}});
        assert_eq!(flatten_strings(&value), "one two");
    }
}
