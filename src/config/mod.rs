//! Configuration module.

mod config_helper;
mod read_config;
mod types;

pub use config_helper::ConfigHelper;
pub use read_config::{parse_override, read_config, ConfigError, ConfigSource};
pub use types::{CacheConfig, Config, ConfigResult, SyncConfig, TransportConfig};
