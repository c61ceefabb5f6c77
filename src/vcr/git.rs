//! Git subprocess operations.
//!
//! All operations are stateless wrappers around the `git` binary, keyed
//! by the repository path passed to each call. Streaming operations pipe
//! child stdout straight into the caller's writer so large files and
//! archives never sit in memory.

use std::path::Path;
use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::quoted::decode_quoted_path;
use super::{CommitInfo, Result, VcrError};

/// Smallest legal ZIP file: the end-of-central-directory record alone.
const EMPTY_ZIP: [u8; 22] = [
    0x50, 0x4b, 0x05, 0x06, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Log format: abbreviated hash, committer time, committer name, subject.
const COMMIT_FORMAT: &str = "%h%x09%ct%x09%cn%x09%s";

/// Stateless adapter over the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitAdapter;

impl GitAdapter {
    pub fn new() -> Self {
        Self
    }

    fn command(repo_path: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo_path).args(args);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a git command and capture its stdout, failing on nonzero exit.
    async fn run(repo_path: &Path, args: &[&str]) -> Result<Vec<u8>> {
        let output = Self::command(repo_path, args).output().await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(VcrError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    /// Run a git command, streaming stdout into `out`.
    async fn run_streaming<W>(repo_path: &Path, args: &[&str], out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut child = Self::command(repo_path, args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");
        // Drain stderr concurrently so a chatty child cannot deadlock.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        tokio::io::copy(&mut stdout, out).await?;
        let status = child.wait().await?;
        let stderr_buf = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(VcrError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            })
        }
    }

    fn parse_commit_line(line: &str) -> Result<CommitInfo> {
        let mut fields = line.splitn(4, '\t');
        let id = fields.next().unwrap_or_default();
        let unix_sec = fields
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| VcrError::BadOutput(line.to_string()))?;
        let committer = fields.next().unwrap_or_default();
        let subject = fields.next().unwrap_or_default();
        if id.is_empty() {
            return Err(VcrError::BadOutput(line.to_string()));
        }
        Ok(CommitInfo {
            id: id.to_string(),
            unix_sec,
            committer: committer.to_string(),
            subject: subject.to_string(),
        })
    }

    /// Head commit of `branch`, or `None` when the branch does not exist.
    pub async fn head_commit(&self, repo_path: &Path, branch: &str) -> Result<Option<CommitInfo>> {
        let verify = Self::command(
            repo_path,
            &[
                "rev-parse",
                "--verify",
                "--quiet",
                &format!("{branch}^{{commit}}"),
            ],
        )
        .output()
        .await?;
        if !verify.status.success() {
            return Ok(None);
        }

        let format = format!("--format={COMMIT_FORMAT}");
        let stdout = Self::run(repo_path, &["log", "-1", &format, branch, "--"]).await?;
        let line = String::from_utf8_lossy(&stdout);
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(None);
        }
        Self::parse_commit_line(line).map(Some)
    }

    /// Last commit that touched `path` on `branch`, or `None`.
    pub async fn last_commit_for_file(
        &self,
        repo_path: &Path,
        branch: &str,
        path: &str,
    ) -> Result<Option<CommitInfo>> {
        let format = format!("--format={COMMIT_FORMAT}");
        let stdout = Self::run(repo_path, &["log", "-1", &format, branch, "--", path]).await?;
        let line = String::from_utf8_lossy(&stdout);
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(None);
        }
        Self::parse_commit_line(line).map(Some)
    }

    /// Whether `id` names a commit in the repository.
    pub async fn is_valid_commit(&self, repo_path: &Path, id: &str) -> Result<bool> {
        // A commit id from a client is untrusted input; never let it be
        // parsed as an option.
        if id.is_empty() || id.starts_with('-') {
            return Ok(false);
        }
        let output = Self::command(repo_path, &["cat-file", "-e", &format!("{id}^{{commit}}")])
            .stderr(Stdio::null())
            .output()
            .await?;
        Ok(output.status.success())
    }

    /// The most recent `limit` commits on `branch`, newest first.
    pub async fn list_commits(
        &self,
        repo_path: &Path,
        branch: &str,
        limit: usize,
    ) -> Result<Vec<CommitInfo>> {
        let format = format!("--format={COMMIT_FORMAT}");
        let count = format!("-{limit}");
        let stdout = Self::run(repo_path, &["log", &count, &format, branch, "--"]).await?;
        String::from_utf8_lossy(&stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(Self::parse_commit_line)
            .collect()
    }

    /// Write every path tracked at `commit`, one per line, quoting decoded.
    pub async fn list_tracked_files<W>(
        &self,
        repo_path: &Path,
        commit: &str,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut child = Self::command(repo_path, &["ls-tree", "-r", "--name-only", commit])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            out.write_all(decode_quoted_path(&line).as_bytes()).await?;
            out.write_all(b"\n").await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(VcrError::CommandFailed {
                command: format!("ls-tree -r --name-only {commit}"),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    /// Write `--name-status` lines for the diff `since..commit`.
    ///
    /// Lines are raw; [`super::parse_change_line`] turns them into
    /// [`super::ChangeEntry`] values and handles quoting.
    pub async fn list_changes<W>(
        &self,
        repo_path: &Path,
        commit: &str,
        since: &str,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        Self::run_streaming(
            repo_path,
            &["diff", "--name-status", "-M", since, commit],
            out,
        )
        .await
    }

    /// Stream the blob at `commit:path` into `out`.
    pub async fn pipe_file_at_commit<W>(
        &self,
        repo_path: &Path,
        commit: &str,
        path: &str,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        Self::run_streaming(repo_path, &["cat-file", "blob", &format!("{commit}:{path}")], out)
            .await
    }

    /// Read the blob at `commit:path`, or `None` when it does not exist.
    pub async fn read_file_at_commit(
        &self,
        repo_path: &Path,
        commit: &str,
        path: &str,
    ) -> Result<Option<Bytes>> {
        let output = Self::command(repo_path, &["cat-file", "blob", &format!("{commit}:{path}")])
            .output()
            .await?;
        if output.status.success() {
            Ok(Some(Bytes::from(output.stdout)))
        } else {
            Ok(None)
        }
    }

    /// Stream a ZIP archive of `paths` at `commit` into `out`.
    ///
    /// An empty path list produces an empty (but valid) archive rather
    /// than the whole tree.
    pub async fn zip_files_at_commit<W>(
        &self,
        repo_path: &Path,
        commit: &str,
        paths: &[String],
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if paths.is_empty() {
            out.write_all(&EMPTY_ZIP).await?;
            return Ok(());
        }
        let mut args: Vec<&str> = vec!["archive", "--format=zip", commit, "--"];
        args.extend(paths.iter().map(String::as_str));
        Self::run_streaming(repo_path, &args, out).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::{parse_change_line, ChangeStatus};
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args([
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@example.com",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("git runs");
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "--quiet"]);
        fs::write(dir.join("index.html"), "<html><body>home</body></html>").unwrap();
        fs::create_dir_all(dir.join("docs")).unwrap();
        fs::write(dir.join("docs/guide.json"), "{\"title\":\"guide\"}").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "initial content"]);
        git(dir, &["branch", "-M", "master"]);
    }

    #[tokio::test]
    async fn head_commit_exists_for_real_branch() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let adapter = GitAdapter::new();

        let head = adapter.head_commit(dir.path(), "master").await.unwrap();
        let head = head.expect("head commit");
        assert!(!head.id.is_empty());
        assert_eq!(head.subject, "initial content");
        assert!(head.unix_sec > 0);
    }

    #[tokio::test]
    async fn head_commit_missing_branch_is_none() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let adapter = GitAdapter::new();
        assert!(adapter
            .head_commit(dir.path(), "no-such-branch")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn lists_tracked_files_at_commit() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let adapter = GitAdapter::new();
        let head = adapter
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();

        let mut buf = Vec::new();
        adapter
            .list_tracked_files(dir.path(), &head.id, &mut buf)
            .await
            .unwrap();
        let listing = String::from_utf8(buf).unwrap();
        let mut paths: Vec<&str> = listing.lines().collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["docs/guide.json", "index.html"]);
    }

    #[tokio::test]
    async fn change_listing_reports_rename_as_delete_plus_add() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let adapter = GitAdapter::new();
        let since = adapter
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();

        git(dir.path(), &["mv", "docs/guide.json", "docs/manual.json"]);
        git(dir.path(), &["commit", "-q", "-m", "rename guide"]);
        let head = adapter
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();

        let mut buf = Vec::new();
        adapter
            .list_changes(dir.path(), &head.id, &since.id, &mut buf)
            .await
            .unwrap();
        let listing = String::from_utf8(buf).unwrap();
        let entries: Vec<_> = listing
            .lines()
            .flat_map(|l| parse_change_line(l).unwrap())
            .collect();

        assert!(entries
            .iter()
            .any(|e| e.path == "docs/guide.json" && e.status == ChangeStatus::Deleted));
        assert!(entries
            .iter()
            .any(|e| e.path == "docs/manual.json" && e.status == ChangeStatus::Added));
    }

    #[tokio::test]
    async fn pipes_file_bytes_at_commit() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let adapter = GitAdapter::new();
        let head = adapter
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();

        let mut buf = Vec::new();
        adapter
            .pipe_file_at_commit(dir.path(), &head.id, "docs/guide.json", &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"{\"title\":\"guide\"}");

        let read = adapter
            .read_file_at_commit(dir.path(), &head.id, "docs/guide.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&read[..], buf.as_slice());
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let adapter = GitAdapter::new();
        let head = adapter
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();
        assert!(adapter
            .read_file_at_commit(dir.path(), &head.id, "nope.txt")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn validates_commits() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let adapter = GitAdapter::new();
        let head = adapter
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();

        assert!(adapter.is_valid_commit(dir.path(), &head.id).await.unwrap());
        assert!(!adapter
            .is_valid_commit(dir.path(), "0000000000000000")
            .await
            .unwrap());
        assert!(!adapter
            .is_valid_commit(dir.path(), "--not-a-commit")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn empty_zip_for_empty_path_list() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let adapter = GitAdapter::new();
        let head = adapter
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();

        let mut buf = Vec::new();
        adapter
            .zip_files_at_commit(dir.path(), &head.id, &[], &mut buf)
            .await
            .unwrap();
        assert_eq!(buf.len(), 22);
        assert_eq!(&buf[..4], b"PK\x05\x06");

        let mut archive = Vec::new();
        adapter
            .zip_files_at_commit(dir.path(), &head.id, &["index.html".to_string()], &mut archive)
            .await
            .unwrap();
        assert_eq!(&archive[..2], b"PK");
        assert!(archive.len() > 22);
    }

    #[tokio::test]
    async fn last_commit_for_file_tracks_the_touching_commit() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let adapter = GitAdapter::new();
        let first = adapter
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();

        fs::write(dir.path().join("index.html"), "<html>changed</html>").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "touch index"]);
        let second = adapter
            .head_commit(dir.path(), "master")
            .await
            .unwrap()
            .unwrap();

        let index = adapter
            .last_commit_for_file(dir.path(), "master", "index.html")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index.id, second.id);

        let guide = adapter
            .last_commit_for_file(dir.path(), "master", "docs/guide.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guide.id, first.id);
    }
}
