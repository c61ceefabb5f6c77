//! Path glob matching for fileset definitions and request filters.
//!
//! The grammar is deliberately small:
//!
//! - `?` matches any single character except `/`
//! - `*` matches zero or more characters except `/`
//! - `**/` matches zero or more whole path segments
//! - everything else, `.` included, is literal
//!
//! A glob compiles to a regular expression anchored at both ends. Globs
//! here are short and few, so no matching machinery beyond the regex
//! engine is warranted.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from glob compilation.
#[derive(Debug, Error)]
pub enum GlobError {
    #[error("invalid glob '{glob}': {source}")]
    Compile {
        glob: String,
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, GlobError>;

// =============================================================================
// Glob
// =============================================================================

/// A single compiled glob.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    /// Compile a glob pattern to its anchored regex equivalent.
    pub fn compile(pattern: &str) -> Result<Self> {
        let mut regex_src = String::with_capacity(pattern.len() * 2 + 2);
        regex_src.push('^');

        let mut chars = pattern.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '?' => regex_src.push_str("[^/]"),
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        // `**/` consumes the trailing slash so that
                        // `**/x` also matches a top-level `x`.
                        if chars.peek() == Some(&'/') {
                            chars.next();
                            regex_src.push_str("(?:[^/]+/)*");
                        } else {
                            regex_src.push_str(".*");
                        }
                    } else {
                        regex_src.push_str("[^/]*");
                    }
                }
                c => regex_src.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex_src.push('$');

        let regex = Regex::new(&regex_src).map_err(|source| GlobError::Compile {
            glob: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

// =============================================================================
// GlobSet
// =============================================================================

/// A set of globs; matches when any member matches.
#[derive(Debug, Clone, Default)]
pub struct GlobSet {
    globs: Vec<Glob>,
}

impl GlobSet {
    pub fn compile<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let globs = patterns
            .into_iter()
            .map(|p| Glob::compile(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { globs })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.globs.iter().any(|g| g.matches(path))
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty()
    }

    pub fn patterns(&self) -> Vec<&str> {
        self.globs.iter().map(|g| g.pattern()).collect()
    }
}

// =============================================================================
// Complement
// =============================================================================

/// Source patterns for a [`Complement`], in their canonical JSON shape.
///
/// This is also the shape the ACM layer fingerprints when a request
/// submits a filter, so field order and naming are load-bearing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ComplementSpec {
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

/// Matches when `includes` matches and `excludes` does not.
#[derive(Debug, Clone)]
pub struct Complement {
    includes: GlobSet,
    excludes: GlobSet,
    spec: ComplementSpec,
}

impl Complement {
    pub fn compile(spec: ComplementSpec) -> Result<Self> {
        Ok(Self {
            includes: GlobSet::compile(&spec.includes)?,
            excludes: GlobSet::compile(&spec.excludes)?,
            spec,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.includes.matches(path) && !self.excludes.matches(path)
    }

    /// The subset of `paths` this complement accepts.
    pub fn filter<'a, I>(&self, paths: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths.into_iter().filter(|p| self.matches(p)).collect()
    }

    pub fn spec(&self) -> &ComplementSpec {
        &self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_mark_is_single_non_separator() {
        let glob = Glob::compile("a?c").unwrap();
        assert!(glob.matches("abc"));
        assert!(glob.matches("axc"));
        assert!(!glob.matches("a/c"));
        assert!(!glob.matches("ac"));
        assert!(!glob.matches("abbc"));
    }

    #[test]
    fn star_stays_within_a_segment() {
        let glob = Glob::compile("docs/*.html").unwrap();
        assert!(glob.matches("docs/index.html"));
        assert!(glob.matches("docs/.html"));
        assert!(!glob.matches("docs/sub/index.html"));
        assert!(!glob.matches("index.html"));
    }

    #[test]
    fn double_star_spans_segments() {
        let glob = Glob::compile("**/*.json").unwrap();
        assert!(glob.matches("a.json"));
        assert!(glob.matches("a/b.json"));
        assert!(glob.matches("a/b/c/d.json"));
        assert!(!glob.matches("a/b.jsonx"));
    }

    #[test]
    fn dot_is_literal() {
        let glob = Glob::compile("index.html").unwrap();
        assert!(glob.matches("index.html"));
        assert!(!glob.matches("indexxhtml"));
    }

    #[test]
    fn anchored_both_ends() {
        let glob = Glob::compile("*.css").unwrap();
        assert!(!glob.matches("style.css.bak"));
        assert!(!glob.matches("x/style.css"));
    }

    #[test]
    fn glob_set_matches_any() {
        let set = GlobSet::compile(["*.html", "*.css"]).unwrap();
        assert!(set.matches("a.html"));
        assert!(set.matches("a.css"));
        assert!(!set.matches("a.js"));
    }

    #[test]
    fn empty_glob_set_matches_nothing() {
        let set = GlobSet::compile(Vec::<String>::new()).unwrap();
        assert!(!set.matches("anything"));
    }

    #[test]
    fn complement_subtracts_excludes() {
        let complement = Complement::compile(ComplementSpec {
            includes: vec!["**/*.html".to_string()],
            excludes: vec!["drafts/**/*.html".to_string(), "drafts/*.html".to_string()],
        })
        .unwrap();
        assert!(complement.matches("pages/a.html"));
        assert!(!complement.matches("drafts/a.html"));
        assert!(!complement.matches("drafts/deep/a.html"));
    }

    #[test]
    fn filter_keeps_matching_paths() {
        let complement = Complement::compile(ComplementSpec {
            includes: vec!["*.md".to_string()],
            excludes: vec![],
        })
        .unwrap();
        let paths = vec!["a.md", "b.txt", "c.md"];
        assert_eq!(complement.filter(paths), vec!["a.md", "c.md"]);
    }
}
