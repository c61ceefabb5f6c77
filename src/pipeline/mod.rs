//! Deterministic, disk-cached result pipelines.
//!
//! A pipeline turns a commit plus request context into an artifact on
//! disk. Each stage streams bytes to the next; stages that declare a
//! path template write their output to `cacheDir/<interpolated path>`
//! first and expose that file downstream. The interpolated file *is* the
//! cache entry: identical variables always produce the same path, and
//! that path always holds byte-equal content, so an existing file
//! short-circuits its stage (and everything upstream of it).
//!
//! Whole invocations are coalesced single-flight on the final artifact
//! path, and a failed stage removes its partial output before the error
//! surfaces, so the cache never holds a torn artifact.

mod jsonl;
mod runtime;
mod template;

pub use jsonl::{map_jsonl_records, read_jsonl_records, write_jsonl_record};
pub use runtime::{PipelineRuntime, Source, Step};
pub use template::interpolate;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::vcr::VcrError;

/// Errors from pipeline execution.
///
/// Payloads are strings so results can flow through single-flight
/// coalescing, which clones the outcome for every waiting caller.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("version control error: {0}")]
    Vcr(String),

    #[error("missing template variable '{0}'")]
    MissingVar(String),

    #[error("unsafe value for template variable '{0}'")]
    UnsafeValue(String),

    #[error("pipeline has no cached final stage")]
    NoArtifactTemplate,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed record: {0}")]
    BadRecord(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

impl From<VcrError> for PipelineError {
    fn from(e: VcrError) -> Self {
        PipelineError::Vcr(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::BadRecord(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// =============================================================================
// Vars
// =============================================================================

/// Per-invocation variables, consumed by path templates.
///
/// Keys are flat dotted names (`ctx.account`, `ctx.auth.group`) so the
/// templates in the fileDB can reference request context directly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vars {
    values: HashMap<String, String>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The value for `key`, or the empty string.
    pub fn get_or_empty(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }
}

// =============================================================================
// Artifact
// =============================================================================

/// Handle to a pipeline result on disk.
///
/// The handle is cheap to clone; the underlying file is opened lazily.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Absolute path of the artifact file.
    pub file: PathBuf,
    /// Commit the artifact was produced at.
    pub commit: String,
    /// ACM group fingerprint the artifact was produced for.
    pub group: String,
    pub mime_type: Option<String>,
    pub cache_control: Option<String>,
}

impl Artifact {
    pub fn new(file: PathBuf, commit: String, group: String) -> Self {
        Self {
            file,
            commit,
            group,
            mime_type: None,
            cache_control: None,
        }
    }

    /// Etag value for responses backed by this artifact.
    pub fn etag(&self) -> String {
        format!("{}-{}", self.commit, self.group)
    }

    /// Open the artifact for reading.
    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.file).await
    }

    pub async fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.file).await
    }

    pub async fn read_to_string(&self) -> std::io::Result<String> {
        tokio::fs::read_to_string(&self.file).await
    }

    pub fn path(&self) -> &Path {
        &self.file
    }
}
