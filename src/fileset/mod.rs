//! Filesets: named, glob-selected subsets of a repository's paths.
//!
//! Every published path belongs to exactly one fileset: the first
//! fileset, in definition order, whose include-minus-exclude matcher
//! accepts it. The owning fileset decides how the path becomes a file
//! record (its processor), whether it is searchable or restricted, and
//! what cache policy its contents carry.

mod cache;
mod html;
mod processor;
mod record;

pub use cache::FilesetCache;
pub use html::{extract_page_meta, relocate_html, text_content};
pub use processor::SearchRecord;
pub use record::{
    FileRecord, RecordStatus, CONTROL_ACM, CONTROL_CATEGORY, CONTROL_COMMIT, CONTROL_CONTROL,
    CONTROL_LATEST,
};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::glob::{Complement, ComplementSpec, GlobError};

/// How a fileset's artifacts may be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    App,
    #[default]
    Content,
    None,
}

/// The record/content processor a fileset uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProcessorKind {
    #[serde(rename = "raw")]
    #[default]
    Raw,
    #[serde(rename = "html-rewrite")]
    HtmlRewrite,
    #[serde(rename = "json-parse")]
    JsonParse,
}

/// Declarative fileset definition, as carried by a repo manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesetDef {
    /// Unique within the repository.
    pub category: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub cache: CacheMode,
    #[serde(default, rename = "cacheControl")]
    pub cache_control: Option<String>,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub restricted: bool,
    /// Named record rewriter applied by the ACM layer.
    #[serde(default)]
    pub acm: Option<String>,
    #[serde(default)]
    pub processor: ProcessorKind,
}

/// A definition compiled for matching. Priority is definition order.
#[derive(Debug, Clone)]
pub struct Fileset {
    pub def: FilesetDef,
    pub priority: usize,
    matcher: Complement,
}

impl Fileset {
    pub fn matches(&self, path: &str) -> bool {
        self.matcher.matches(path)
    }

    pub fn category(&self) -> &str {
        &self.def.category
    }
}

/// An ordered, compiled fileset list for one branch.
#[derive(Debug, Clone)]
pub struct FilesetList {
    filesets: Vec<Arc<Fileset>>,
}

impl FilesetList {
    pub fn compile(defs: Vec<FilesetDef>) -> Result<Self, GlobError> {
        let filesets = defs
            .into_iter()
            .enumerate()
            .map(|(priority, def)| {
                let matcher = Complement::compile(ComplementSpec {
                    includes: def.include.clone(),
                    excludes: def.exclude.clone(),
                })?;
                Ok(Arc::new(Fileset {
                    def,
                    priority,
                    matcher,
                }))
            })
            .collect::<Result<Vec<_>, GlobError>>()?;
        Ok(Self { filesets })
    }

    /// The fileset owning `path`: first match in priority order.
    pub fn lookup(&self, path: &str) -> Option<&Arc<Fileset>> {
        self.filesets.iter().find(|fs| fs.matches(path))
    }

    pub fn by_category(&self, category: &str) -> Option<&Arc<Fileset>> {
        self.filesets.iter().find(|fs| fs.category() == category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Fileset>> {
        self.filesets.iter()
    }

    pub fn categories(&self) -> Vec<&str> {
        self.filesets.iter().map(|fs| fs.category()).collect()
    }
}

/// The built-in fileset list used when a manifest defines none.
pub fn default_filesets() -> Vec<FilesetDef> {
    vec![
        FilesetDef {
            category: "pages".to_string(),
            include: vec!["**/*.html".to_string()],
            exclude: vec![],
            cache: CacheMode::Content,
            cache_control: Some("public, must-revalidate, max-age=60".to_string()),
            searchable: true,
            restricted: false,
            acm: None,
            processor: ProcessorKind::HtmlRewrite,
        },
        FilesetDef {
            category: "data".to_string(),
            include: vec!["**/*.json".to_string()],
            exclude: vec!["locomote.json".to_string()],
            cache: CacheMode::None,
            cache_control: None,
            searchable: true,
            restricted: false,
            acm: None,
            processor: ProcessorKind::JsonParse,
        },
        FilesetDef {
            category: "files".to_string(),
            include: vec!["**/*".to_string()],
            exclude: vec!["locomote.json".to_string()],
            cache: CacheMode::Content,
            cache_control: Some("public, max-age=600".to_string()),
            searchable: false,
            restricted: false,
            acm: None,
            processor: ProcessorKind::Raw,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> FilesetList {
        FilesetList::compile(default_filesets()).unwrap()
    }

    #[test]
    fn first_matching_fileset_owns_the_path() {
        let list = list();
        assert_eq!(list.lookup("docs/a.html").unwrap().category(), "pages");
        assert_eq!(list.lookup("docs/a.json").unwrap().category(), "data");
        assert_eq!(list.lookup("img/logo.png").unwrap().category(), "files");
    }

    #[test]
    fn manifest_file_is_owned_by_nothing() {
        assert!(list().lookup("locomote.json").is_none());
    }

    #[test]
    fn exactly_one_owner_per_path() {
        let list = list();
        for path in ["a.html", "deep/b.json", "c.css"] {
            let owners: Vec<_> = list.iter().filter(|fs| fs.matches(path)).collect();
            // Several may match, but ownership is the first by priority.
            let owner = list.lookup(path).unwrap();
            assert_eq!(owner.priority, owners[0].priority);
        }
    }

    #[test]
    fn priority_follows_definition_order() {
        let defs = vec![
            FilesetDef {
                category: "first".to_string(),
                include: vec!["*.txt".to_string()],
                ..plain_def()
            },
            FilesetDef {
                category: "second".to_string(),
                include: vec!["**/*".to_string()],
                ..plain_def()
            },
        ];
        let list = FilesetList::compile(defs).unwrap();
        assert_eq!(list.lookup("note.txt").unwrap().category(), "first");
        assert_eq!(list.lookup("note.md").unwrap().category(), "second");
    }

    fn plain_def() -> FilesetDef {
        FilesetDef {
            category: String::new(),
            include: vec![],
            exclude: vec![],
            cache: CacheMode::Content,
            cache_control: None,
            searchable: false,
            restricted: false,
            acm: None,
            processor: ProcessorKind::Raw,
        }
    }
}
