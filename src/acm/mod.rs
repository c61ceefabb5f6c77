//! Access control and record modification.
//!
//! Per repository the ACM engine derives auth settings (method, users,
//! fileset fingerprints, rewrites) from server defaults plus the
//! manifest; per request it authenticates the caller, derives extra
//! group memberships from headers and parameters, and produces an
//! [`AuthContext`]: the set of accessible categories, a deterministic
//! `group` fingerprint that keys every cache the request touches, and
//! the record filter/rewrite applied to everything streamed back.

mod authenticate;
mod derived;
mod settings;

pub use authenticate::{authenticate, AuthUser};
pub use derived::{derive, DerivedAuth, RequestAuthInput};
pub use settings::{AuthDefaults, AuthSettings, SettingsCache, UserEntry};

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::fileset::FileRecord;
use crate::glob::Complement;
use crate::util::fingerprint_parts;

/// Group prefix for client-visible-set derived groups.
pub const CVS_GROUP_PREFIX: &str = "CVS:";

#[derive(Debug, Clone, Error)]
pub enum AcmError {
    /// Secure context without credentials; maps to 401 with a challenge.
    #[error("authentication required")]
    AuthRequired { realm: String },

    /// Credentials present but wrong; 401, realm echoed.
    #[error("authentication failed")]
    AuthFailed { realm: String },

    #[error("unknown auth method '{0}'")]
    UnknownMethod(String),

    #[error("malformed client visible set: {0}")]
    BadVisibleSet(String),

    #[error("{0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, AcmError>;

// =============================================================================
// Record Filters
// =============================================================================

/// A per-request predicate over file records.
#[derive(Debug, Clone)]
pub enum RecordFilter {
    /// Glob filter from request parameters.
    Paths(Complement),
    /// Client-visible-set delta filter: pass records the client does
    /// not have, has at another version, or must delete.
    VisibleSet(std::collections::HashMap<String, String>),
}

impl RecordFilter {
    pub fn accepts(&self, record: &FileRecord) -> bool {
        let path = match record.path.as_deref() {
            Some(path) => path,
            None => return true,
        };
        match self {
            RecordFilter::Paths(complement) => complement.matches(path),
            RecordFilter::VisibleSet(cvs) => {
                let known = cvs.get(path);
                if record.is_deleted() {
                    // Deletions only matter for files the client holds.
                    known.is_some()
                } else {
                    match (known, record.commit.as_deref()) {
                        (None, _) => true,
                        (Some(version), Some(commit)) => version != commit,
                        (Some(_), None) => true,
                    }
                }
            }
        }
    }
}

// =============================================================================
// AuthContext
// =============================================================================

/// The fully derived authorization state of one request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub settings: Arc<AuthSettings>,
    pub user_info: AuthUser,
    /// Categories (and groups) this request may see.
    pub accessible: HashSet<String>,
    /// Fingerprint of the canonicalized accessible set; keys caches.
    pub group: String,
    /// Same fingerprint with CVS-derived groups removed.
    pub visible_group: String,
    filters: Vec<RecordFilter>,
}

impl AuthContext {
    /// Assemble the context from settings, the authenticated user, and
    /// per-request derived auth.
    pub fn build(settings: Arc<AuthSettings>, user_info: AuthUser, derived: DerivedAuth) -> Self {
        let mut accessible: HashSet<String> = settings.unrestricted_categories();
        accessible.extend(user_info.groups.iter().cloned());
        accessible.extend(derived.groups.iter().cloned());

        let group = Self::group_fingerprint(&settings, &accessible, true);
        let visible_group = Self::group_fingerprint(&settings, &accessible, false);

        Self {
            settings,
            user_info,
            accessible,
            group,
            visible_group,
            filters: derived.filters,
        }
    }

    /// Canonicalize the accessible set and fingerprint it: categories
    /// are replaced by their fileset fingerprints, the list is sorted,
    /// and (for the visible variant) CVS groups are dropped.
    fn group_fingerprint(
        settings: &AuthSettings,
        accessible: &HashSet<String>,
        include_cvs: bool,
    ) -> String {
        let mut parts: Vec<String> = accessible
            .iter()
            .filter(|name| include_cvs || !name.starts_with(CVS_GROUP_PREFIX))
            .map(|name| {
                settings
                    .fingerprints
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| name.clone())
            })
            .collect();
        parts.sort_unstable();
        fingerprint_parts(&parts)
    }

    /// Whether the request's filters accept `record`.
    pub fn filter(&self, record: &FileRecord) -> bool {
        self.filters.iter().all(|f| f.accepts(record))
    }

    /// Apply accessibility, filters, and the category rewriter.
    ///
    /// Control records pass through untouched. `None` means the record
    /// is withheld from this request.
    pub fn filter_and_rewrite(&self, record: FileRecord) -> Option<FileRecord> {
        if record.is_control() {
            return Some(record);
        }
        if !self.accessible.contains(&record.category) {
            return None;
        }
        if !self.filter(&record) {
            return None;
        }
        match self.settings.rewrites.get(&record.category) {
            Some(rewriter) => apply_rewrite(rewriter, record),
            None => Some(record),
        }
    }
}

/// Named record rewriters attachable to a fileset via its `acm` field.
fn apply_rewrite(name: &str, mut record: FileRecord) -> Option<FileRecord> {
    match name {
        // Publish existence and commit only; strip processor payloads.
        "strip-data" => {
            record.data = None;
            record.page = None;
            Some(record)
        }
        // Hide the records entirely; contents stay fetchable by path.
        "records-hidden" => None,
        _ => {
            log::warn!("unknown rewriter '{name}', applying identity");
            Some(record)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::{default_filesets, FilesetList};
    use crate::glob::ComplementSpec;

    fn settings() -> Arc<AuthSettings> {
        let filesets = Arc::new(FilesetList::compile(default_filesets()).unwrap());
        Arc::new(AuthSettings::build_for_test(filesets))
    }

    fn anonymous() -> AuthUser {
        AuthUser {
            user: "anonymous".to_string(),
            authenticated: false,
            groups: vec![],
        }
    }

    #[test]
    fn group_is_deterministic_and_order_free() {
        let settings = settings();
        let a = AuthContext::build(
            Arc::clone(&settings),
            AuthUser {
                user: "u".to_string(),
                authenticated: true,
                groups: vec!["x".to_string(), "y".to_string()],
            },
            DerivedAuth::default(),
        );
        let b = AuthContext::build(
            Arc::clone(&settings),
            AuthUser {
                user: "u".to_string(),
                authenticated: true,
                groups: vec!["y".to_string(), "x".to_string()],
            },
            DerivedAuth::default(),
        );
        assert_eq!(a.group, b.group);
    }

    #[test]
    fn cvs_groups_are_stripped_from_visible_group() {
        let settings = settings();
        let plain = AuthContext::build(Arc::clone(&settings), anonymous(), DerivedAuth::default());

        let mut derived = DerivedAuth::default();
        derived.groups.push("CVS:abcd".to_string());
        let with_cvs = AuthContext::build(Arc::clone(&settings), anonymous(), derived);

        assert_ne!(plain.group, with_cvs.group);
        assert_eq!(plain.group, with_cvs.visible_group);
        assert_eq!(with_cvs.visible_group, plain.visible_group);
    }

    #[test]
    fn inaccessible_category_is_withheld() {
        let ctx = AuthContext::build(settings(), anonymous(), DerivedAuth::default());
        let record = FileRecord::published("secret.html", "premium", "c1");
        assert!(ctx.filter_and_rewrite(record).is_none());

        let ok = FileRecord::published("page.html", "pages", "c1");
        assert!(ctx.filter_and_rewrite(ok).is_some());
    }

    #[test]
    fn control_records_always_pass() {
        let ctx = AuthContext::build(settings(), anonymous(), DerivedAuth::default());
        assert!(ctx
            .filter_and_rewrite(FileRecord::control_latest("abc"))
            .is_some());
    }

    #[test]
    fn path_filter_narrows_records() {
        let complement = Complement::compile(ComplementSpec {
            includes: vec!["docs/**/*".to_string(), "docs/*".to_string()],
            excludes: vec![],
        })
        .unwrap();
        let mut derived = DerivedAuth::default();
        derived.filters.push(RecordFilter::Paths(complement));
        let ctx = AuthContext::build(settings(), anonymous(), derived);

        let inside = FileRecord::published("docs/a.html", "pages", "c1");
        let outside = FileRecord::published("other/a.html", "pages", "c1");
        assert!(ctx.filter_and_rewrite(inside).is_some());
        assert!(ctx.filter_and_rewrite(outside).is_none());
    }

    #[test]
    fn visible_set_filter_passes_new_changed_and_deleted() {
        let mut cvs = std::collections::HashMap::new();
        cvs.insert("a.html".to_string(), "c1".to_string());
        cvs.insert("b.html".to_string(), "c2".to_string());
        let filter = RecordFilter::VisibleSet(cvs);

        // Unchanged: client already has this version.
        assert!(!filter.accepts(&FileRecord::published("a.html", "pages", "c1")));
        // Changed version.
        assert!(filter.accepts(&FileRecord::published("a.html", "pages", "c9")));
        // New file.
        assert!(filter.accepts(&FileRecord::published("new.html", "pages", "c1")));
        // Deleted and client holds it.
        assert!(filter.accepts(&FileRecord::deleted("b.html", "pages", "c9")));
        // Deleted but client never had it.
        assert!(!filter.accepts(&FileRecord::deleted("ghost.html", "pages", "c9")));
    }

    #[test]
    fn strip_data_rewriter_removes_payloads() {
        let mut record = FileRecord::published("x.json", "data", "c1");
        record.data = Some(serde_json::json!({"secret": true}));
        let rewritten = apply_rewrite("strip-data", record).unwrap();
        assert!(rewritten.data.is_none());
    }
}
