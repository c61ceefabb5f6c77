//! Read-only adapter over the version-control tool.
//!
//! Every interaction with the external `git` binary lives here; no other
//! component spawns processes. The adapter exposes the handful of
//! operations the pipelines need: commit lookups, tracked-file listings,
//! diffs between commits, raw file content, and ZIP archives.

mod git;
mod quoted;

pub use git::GitAdapter;
pub use quoted::decode_quoted_path;

use thiserror::Error;

/// Errors from version-control operations.
#[derive(Debug, Error)]
pub enum VcrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unparseable git output: {0}")]
    BadOutput(String),
}

pub type Result<T> = std::result::Result<T, VcrError>;

// =============================================================================
// Commit Types
// =============================================================================

/// Metadata for one commit, as surfaced to clients and caches.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommitInfo {
    /// Abbreviated commit hash.
    pub id: String,
    /// Committer timestamp, seconds since the epoch.
    pub unix_sec: i64,
    /// Committer name.
    pub committer: String,
    /// First line of the commit message.
    pub subject: String,
}

impl CommitInfo {
    /// The committer timestamp as a UTC datetime.
    pub fn committed_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(self.unix_sec, 0)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
    }
}

/// One entry from a diff between two commits.
///
/// Renames and copies are already flattened: the old path appears as a
/// [`ChangeStatus::Deleted`] entry and the new path as
/// [`ChangeStatus::Added`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub path: String,
    pub status: ChangeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    /// Unmerged or unknown; treated as modified content.
    Other,
}

impl ChangeStatus {
    /// Whether the path still exists at the newer commit.
    pub fn is_active(self) -> bool {
        !matches!(self, ChangeStatus::Deleted)
    }
}

/// Parse one `--name-status` line into change entries.
///
/// Regular lines are `<status>\t<path>`; renames and copies are
/// `R<score>\t<old>\t<new>` and expand to a delete plus an add.
pub fn parse_change_line(line: &str) -> Result<Vec<ChangeEntry>> {
    let mut fields = line.split('\t');
    let status = fields
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| VcrError::BadOutput(line.to_string()))?;

    let kind = status.chars().next().unwrap_or(' ');
    match kind {
        'R' | 'C' => {
            let old_path = fields
                .next()
                .ok_or_else(|| VcrError::BadOutput(line.to_string()))?;
            let new_path = fields
                .next()
                .ok_or_else(|| VcrError::BadOutput(line.to_string()))?;
            let mut entries = Vec::with_capacity(2);
            // A copy leaves the source in place; only a rename deletes it.
            if kind == 'R' {
                entries.push(ChangeEntry {
                    path: decode_quoted_path(old_path),
                    status: ChangeStatus::Deleted,
                });
            }
            entries.push(ChangeEntry {
                path: decode_quoted_path(new_path),
                status: ChangeStatus::Added,
            });
            Ok(entries)
        }
        _ => {
            let path = fields
                .next()
                .ok_or_else(|| VcrError::BadOutput(line.to_string()))?;
            let status = match kind {
                'A' => ChangeStatus::Added,
                'M' | ' ' => ChangeStatus::Modified,
                'D' => ChangeStatus::Deleted,
                _ => ChangeStatus::Other,
            };
            Ok(vec![ChangeEntry {
                path: decode_quoted_path(path),
                status,
            }])
        }
    }
}
