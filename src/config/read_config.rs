//! Configuration file reading and parsing.
//!
//! Locates, reads, and parses INI-format configuration files, layering
//! built-in defaults, the base config file, and individual `key=value`
//! overrides (applied last).

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use configparser::ini::Ini;
use thiserror::Error;

use crate::manifest::BuildProfile;

use super::{
    AuthConfig, BuildSettings, ByteSize, CacheConfig, Config, ContentConfig, ListenerConfig,
    SearchSettings, ServerConfig,
};

// =============================================================================
// Constants - Default Values
// =============================================================================

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8010;
const DEFAULT_MOUNT_PATH: &str = "/";
const DEFAULT_CACHE_CONTROL: &str = "public, must-revalidate, max-age=60";
const DEFAULT_REPO_HOME: &str = "/var/locomote/content";
const DEFAULT_CACHE_DIR: &str = "/var/locomote/cache";
const DEFAULT_GC_INTERVAL_SECS: u64 = 3600;
const DEFAULT_GC_MAX_AGE_DAYS: u64 = 7;
const DEFAULT_GC_PRESERVE: &str = "idb/**/*";
const DEFAULT_SEARCH_QUOTA: u64 = 250 * 1024;
const DEFAULT_WORKSPACE_HOME: &str = "/var/locomote/workspace";
const DEFAULT_LISTENER_HOST: &str = "localhost";
const DEFAULT_LISTENER_PORT: u16 = 8870;
const DEFAULT_AUTH_METHOD: &str = "basic";
const DEFAULT_AUTH_REALM: &str = "Locomote";

const ENV_CONFIG_FILE: &str = "LOCOMOTE_CONFIG_FILE";
const DEFAULT_CONFIG_FILENAME: &str = ".locomote.conf";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid byte size '{value}': {message}")]
    InvalidByteSize { value: String, message: String },

    #[error("invalid integer '{value}' for key '{key}'")]
    InvalidInteger { key: String, value: String },

    #[error("invalid boolean '{value}' for key '{key}'")]
    InvalidBoolean { key: String, value: String },

    #[error("invalid override key '{key}': {message}")]
    InvalidOverrideKey { key: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// =============================================================================
// ConfigSource
// =============================================================================

/// Specifies how to locate and layer configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    /// Explicit config file path from the CLI. Must exist if given.
    /// Otherwise `LOCOMOTE_CONFIG_FILE`, then `~/.locomote.conf`.
    pub config_file: Option<PathBuf>,

    /// Individual key=value overrides, dot-notation keys
    /// ("server.port", "cache.dir"), applied last.
    pub overrides: Vec<(String, String)>,
}

// =============================================================================
// ByteSize Parsing
// =============================================================================

impl ByteSize {
    /// Parse "250KB", "1GB", "500", etc.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let num_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if num_end == 0 {
            return Err(ConfigError::InvalidByteSize {
                value: s.to_string(),
                message: "no numeric value".to_string(),
            });
        }
        let base: u64 = s[..num_end]
            .parse()
            .map_err(|e| ConfigError::InvalidByteSize {
                value: s.to_string(),
                message: format!("invalid number: {e}"),
            })?;
        let multiplier: u64 = match s[num_end..].trim().to_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" => 1024,
            "M" | "MB" => 1024 * 1024,
            "G" | "GB" => 1024 * 1024 * 1024,
            suffix => {
                return Err(ConfigError::InvalidByteSize {
                    value: s.to_string(),
                    message: format!("unknown suffix '{suffix}'"),
                });
            }
        };
        Ok(ByteSize(base.saturating_mul(multiplier)))
    }
}

// =============================================================================
// Value Parsing
// =============================================================================

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBoolean {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| ConfigError::InvalidInteger {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u16(key: &str, value: &str) -> Result<u16> {
    value.parse().map_err(|_| ConfigError::InvalidInteger {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_comma_separated(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Config File Resolution
// =============================================================================

fn resolve_config_file(source: &ConfigSource) -> Result<Option<PathBuf>> {
    if let Some(ref path) = source.config_file {
        if path.exists() {
            return Ok(Some(path.clone()));
        }
        return Err(ConfigError::FileNotFound(path.clone()));
    }

    if let Ok(env_path) = env::var(ENV_CONFIG_FILE) {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Ok(Some(path));
        }
        log::warn!("config file named by {ENV_CONFIG_FILE} does not exist: {env_path}");
        return Ok(None);
    }

    if let Some(home) = env::var_os("HOME").map(PathBuf::from) {
        let default_path = home.join(DEFAULT_CONFIG_FILENAME);
        if default_path.exists() {
            return Ok(Some(default_path));
        }
    }
    Ok(None)
}

// =============================================================================
// Default Config
// =============================================================================

/// A [`Config`] with all default values.
pub fn default_config() -> Config {
    Config {
        server: ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            cache_control: DEFAULT_CACHE_CONTROL.to_string(),
            errors_dir: None,
        },
        content: ContentConfig {
            repo_home: PathBuf::from(DEFAULT_REPO_HOME),
        },
        cache: CacheConfig {
            dir: PathBuf::from(DEFAULT_CACHE_DIR),
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
            gc_max_age_days: DEFAULT_GC_MAX_AGE_DAYS,
            gc_preserve: parse_comma_separated(DEFAULT_GC_PRESERVE),
        },
        search: SearchSettings {
            db_path: PathBuf::from(DEFAULT_CACHE_DIR).join("search.sqlite"),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR).join("publish_cache/search"),
            quota: ByteSize(DEFAULT_SEARCH_QUOTA),
        },
        build: BuildSettings {
            enabled: true,
            workspace_home: PathBuf::from(DEFAULT_WORKSPACE_HOME),
            command: None,
            profiles: HashMap::new(),
        },
        updates_listener: ListenerConfig {
            host: DEFAULT_LISTENER_HOST.to_string(),
            port: DEFAULT_LISTENER_PORT,
        },
        auth: AuthConfig {
            method: DEFAULT_AUTH_METHOD.to_string(),
            realm: DEFAULT_AUTH_REALM.to_string(),
        },
    }
}

// =============================================================================
// INI Parsing
// =============================================================================

fn apply_ini_to_config(config: &mut Config, ini: &Ini) -> Result<()> {
    // [server]
    if let Some(host) = ini.get("server", "host") {
        config.server.host = host;
    }
    if let Some(port) = ini.get("server", "port") {
        config.server.port = parse_u16("server.port", &port)?;
    }
    if let Some(mount) = ini.get("server", "mount_path") {
        config.server.mount_path = mount;
    }
    if let Some(cc) = ini.get("server", "cache_control") {
        config.server.cache_control = cc;
    }
    if let Some(dir) = ini.get("server", "errors_dir") {
        config.server.errors_dir = Some(PathBuf::from(dir));
    }

    // [content]
    if let Some(home) = ini.get("content", "repo_home") {
        config.content.repo_home = PathBuf::from(home);
    }

    // [cache]
    if let Some(dir) = ini.get("cache", "dir") {
        config.cache.dir = PathBuf::from(dir);
    }
    if let Some(secs) = ini.get("cache", "gc_interval_secs") {
        config.cache.gc_interval_secs = parse_u64("cache.gc_interval_secs", &secs)?;
    }
    if let Some(days) = ini.get("cache", "gc_max_age_days") {
        config.cache.gc_max_age_days = parse_u64("cache.gc_max_age_days", &days)?;
    }
    if let Some(preserve) = ini.get("cache", "gc_preserve") {
        config.cache.gc_preserve = parse_comma_separated(&preserve);
    }

    // [search]
    if let Some(path) = ini.get("search", "db_path") {
        config.search.db_path = PathBuf::from(path);
    }
    if let Some(dir) = ini.get("search", "cache_dir") {
        config.search.cache_dir = PathBuf::from(dir);
    }
    if let Some(quota) = ini.get("search", "quota") {
        config.search.quota = ByteSize::parse(&quota)?;
    }

    // [build]
    if let Some(enabled) = ini.get("build", "enabled") {
        config.build.enabled = parse_bool("build.enabled", &enabled)?;
    }
    if let Some(home) = ini.get("build", "workspace_home") {
        config.build.workspace_home = PathBuf::from(home);
    }
    if let Some(command) = ini.get("build", "command") {
        config.build.command = Some(command);
    }

    // [updates-listener]
    if let Some(host) = ini.get("updates-listener", "host") {
        config.updates_listener.host = host;
    }
    if let Some(port) = ini.get("updates-listener", "port") {
        config.updates_listener.port = parse_u16("updates-listener.port", &port)?;
    }

    // [auth]
    if let Some(method) = ini.get("auth", "method") {
        config.auth.method = method;
    }
    if let Some(realm) = ini.get("auth", "realm") {
        config.auth.realm = realm;
    }

    // [profile.*] named build profiles.
    for section in ini.sections() {
        if let Some(name) = section.strip_prefix("profile.") {
            let buildable = ini
                .get(&section, "buildable")
                .map(|b| parse_comma_separated(&b))
                .unwrap_or_default();
            let command = ini.get(&section, "command");
            config.build.profiles.insert(
                name.to_string(),
                BuildProfile { buildable, command },
            );
        }
    }

    Ok(())
}

fn load_ini(path: &Path) -> Result<Ini> {
    let mut ini = Ini::new();
    ini.load(path).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        message: e,
    })?;
    Ok(ini)
}

// =============================================================================
// Override Application
// =============================================================================

fn apply_override(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let bad_key = |message: &str| ConfigError::InvalidOverrideKey {
        key: key.to_string(),
        message: message.to_string(),
    };

    match key.splitn(2, '.').collect::<Vec<_>>().as_slice() {
        ["server", "host"] => config.server.host = value.to_string(),
        ["server", "port"] => config.server.port = parse_u16(key, value)?,
        ["server", "mount_path"] => config.server.mount_path = value.to_string(),
        ["server", "cache_control"] => config.server.cache_control = value.to_string(),
        ["server", "errors_dir"] => config.server.errors_dir = Some(PathBuf::from(value)),
        ["content", "repo_home"] => config.content.repo_home = PathBuf::from(value),
        ["cache", "dir"] => config.cache.dir = PathBuf::from(value),
        ["cache", "gc_interval_secs"] => {
            config.cache.gc_interval_secs = parse_u64(key, value)?;
        }
        ["cache", "gc_max_age_days"] => {
            config.cache.gc_max_age_days = parse_u64(key, value)?;
        }
        ["cache", "gc_preserve"] => config.cache.gc_preserve = parse_comma_separated(value),
        ["search", "db_path"] => config.search.db_path = PathBuf::from(value),
        ["search", "cache_dir"] => config.search.cache_dir = PathBuf::from(value),
        ["search", "quota"] => config.search.quota = ByteSize::parse(value)?,
        ["build", "enabled"] => config.build.enabled = parse_bool(key, value)?,
        ["build", "workspace_home"] => config.build.workspace_home = PathBuf::from(value),
        ["build", "command"] => config.build.command = Some(value.to_string()),
        ["updates-listener", "host"] => config.updates_listener.host = value.to_string(),
        ["updates-listener", "port"] => {
            config.updates_listener.port = parse_u16(key, value)?;
        }
        ["auth", "method"] => config.auth.method = value.to_string(),
        ["auth", "realm"] => config.auth.realm = value.to_string(),
        _ => return Err(bad_key("unrecognized key")),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

/// Read and parse configuration from the specified sources.
///
/// Configuration is layered in this order:
/// 1. Built-in defaults
/// 2. Base config file (from CLI, env var, or `~/.locomote.conf`)
/// 3. Individual overrides (applied last)
pub fn read_config(source: &ConfigSource) -> Result<Config> {
    let mut config = default_config();

    if let Some(ref path) = resolve_config_file(source)? {
        let ini = load_ini(path)?;
        apply_ini_to_config(&mut config, &ini)?;
    }

    for (key, value) in &source.overrides {
        apply_override(&mut config, key, value)?;
    }

    Ok(config)
}
