//! File records and control records.
//!
//! A file record describes one published or deleted path. Control
//! records share the wire shape but use `$`-prefixed categories; they
//! carry listing-level metadata (per-category commits, commit infos,
//! the ACM group, the branch head) and the reset marker emitted when a
//! client's `since` commit is unknown.

use serde::{Deserialize, Serialize};

use crate::vcr::CommitInfo;

pub const CONTROL_CATEGORY: &str = "$category";
pub const CONTROL_COMMIT: &str = "$commit";
pub const CONTROL_ACM: &str = "$acm";
pub const CONTROL_LATEST: &str = "$latest";
pub const CONTROL_CONTROL: &str = "$control";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Published,
    Deleted,
}

/// One line of a JSON-lines listing artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Owning fileset category, or a `$`-prefixed control category.
    pub category: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,

    /// Short hash of the last commit that modified `path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    /// Page metadata extracted by the html-rewrite processor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<serde_json::Value>,

    /// Parsed value embedded by the json-parse processor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// `$category` control records: the category's name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// `$acm` control records: the ACM group fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// `$commit` control records: the commit's metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<CommitInfo>,

    /// `$control` records: the directive, currently only `reset`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directive: Option<String>,
}

impl FileRecord {
    fn empty(category: &str) -> Self {
        Self {
            path: None,
            category: category.to_string(),
            status: None,
            commit: None,
            page: None,
            data: None,
            name: None,
            group: None,
            info: None,
            directive: None,
        }
    }

    pub fn published(path: &str, category: &str, commit: &str) -> Self {
        let mut record = Self::empty(category);
        record.path = Some(path.to_string());
        record.status = Some(RecordStatus::Published);
        record.commit = Some(commit.to_string());
        record
    }

    /// Deleted records never carry processor fields.
    pub fn deleted(path: &str, category: &str, commit: &str) -> Self {
        let mut record = Self::empty(category);
        record.path = Some(path.to_string());
        record.status = Some(RecordStatus::Deleted);
        record.commit = Some(commit.to_string());
        record
    }

    pub fn control_category(name: &str, commit: &str) -> Self {
        let mut record = Self::empty(CONTROL_CATEGORY);
        record.name = Some(name.to_string());
        record.commit = Some(commit.to_string());
        record
    }

    pub fn control_commit(info: CommitInfo) -> Self {
        let mut record = Self::empty(CONTROL_COMMIT);
        record.commit = Some(info.id.clone());
        record.info = Some(info);
        record
    }

    pub fn control_acm(group: &str) -> Self {
        let mut record = Self::empty(CONTROL_ACM);
        record.group = Some(group.to_string());
        record
    }

    pub fn control_latest(commit: &str) -> Self {
        let mut record = Self::empty(CONTROL_LATEST);
        record.commit = Some(commit.to_string());
        record
    }

    pub fn control_reset() -> Self {
        let mut record = Self::empty(CONTROL_CONTROL);
        record.directive = Some("reset".to_string());
        record
    }

    pub fn is_control(&self) -> bool {
        self.category.starts_with('$')
    }

    pub fn is_deleted(&self) -> bool {
        self.status == Some(RecordStatus::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_record_serializes_compactly() {
        let record = FileRecord::published("a.html", "pages", "c2");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "path": "a.html",
                "category": "pages",
                "status": "published",
                "commit": "c2",
            })
        );
    }

    #[test]
    fn deleted_record_has_no_processor_fields() {
        let record = FileRecord::deleted("a.html", "pages", "c2");
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("page"));
        assert!(!json.contains("data"));
        assert!(json.contains("\"status\":\"deleted\""));
    }

    #[test]
    fn control_records_are_flagged() {
        assert!(FileRecord::control_reset().is_control());
        assert!(FileRecord::control_acm("g").is_control());
        assert!(FileRecord::control_latest("abc").is_control());
        assert!(!FileRecord::published("p", "c", "x").is_control());
    }

    #[test]
    fn round_trips_through_jsonl() {
        let mut record = FileRecord::published("guide.json", "data", "abc1234");
        record.data = Some(serde_json::json!({"title": "guide"}));
        let line = serde_json::to_string(&record).unwrap();
        let back: FileRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, record);
    }
}
