//! Server configuration: types, parsing, and layered resolution.

mod read_config;
mod types;

pub use read_config::{default_config, read_config, ConfigError, ConfigSource};
pub use types::{
    AuthConfig, BuildSettings, ByteSize, CacheConfig, Config, ContentConfig, ListenerConfig,
    SearchSettings, ServerConfig,
};
