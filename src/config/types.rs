//! Configuration types for the server.
//!
//! These structures represent the application configuration as parsed
//! from an INI-format config file plus command-line overrides.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::manifest::BuildProfile;

/// A byte size that can be parsed from strings like "250KB" or "1GB".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

/// [server] section - the HTTP surface.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path prefix the content API is mounted at.
    pub mount_path: String,
    /// Default `Cache-Control` for responses without a fileset policy.
    pub cache_control: String,
    /// Directory of error pages (`404.html`, `xxx.html`).
    pub errors_dir: Option<PathBuf>,
}

/// [content] section - where the bare repositories live.
#[derive(Debug, Clone)]
pub struct ContentConfig {
    pub repo_home: PathBuf,
}

/// [cache] section - the pipeline artifact cache and its sweeper.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Seconds between GC sweeps.
    pub gc_interval_secs: u64,
    /// Files untouched for this many days are collected.
    pub gc_max_age_days: u64,
    /// Glob patterns (relative to the cache root) never collected.
    pub gc_preserve: Vec<String>,
}

/// [search] section.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    /// Per-branch result cache quota.
    pub quota: ByteSize,
}

/// [build] section plus the named [profile.*] sections.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub enabled: bool,
    pub workspace_home: PathBuf,
    /// Fallback command when a profile names none.
    pub command: Option<String>,
    pub profiles: HashMap<String, BuildProfile>,
}

/// [updates-listener] section - the post-receive hook endpoint.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

/// [auth] section - server-wide authentication defaults.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub method: String,
    pub realm: String,
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub content: ContentConfig,
    pub cache: CacheConfig,
    pub search: SearchSettings,
    pub build: BuildSettings,
    pub updates_listener: ListenerConfig,
    pub auth: AuthConfig,
}
