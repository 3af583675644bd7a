//! Configuration file reading and parsing.
//!
//! This module handles locating, reading, and parsing INI-format configuration files,
//! with support for layered overrides.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use configparser::ini::Ini;
use thiserror::Error;

use crate::commit::{ConflictResolution, DEFAULT_MAX_ATTEMPTS_PER_CHANGE};
use crate::download::DEFAULT_BATCH_SIZE;
use crate::store::DEFAULT_MAX_ITEMS_IN_MEMORY;

use super::{CacheConfig, Config, ConfigResult, SyncConfig, TransportConfig};

// =============================================================================
// Constants - Default Values
// =============================================================================

const DEFAULT_CACHE_PATH: &str = "/tmp/thingcache";
const DEFAULT_CACHE_NO_CACHE: bool = false;
const DEFAULT_CACHE_MAX_AGE_SECONDS: u64 = 5 * 60;
const DEFAULT_SYNC_INTERVAL_SECONDS: u64 = 15 * 60;
const DEFAULT_SYNC_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_LOCK_RETRY_COUNT: u32 = 20;
const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 50;
const DEFAULT_TRANSPORT_RETRY_COUNT: u32 = 2;
const DEFAULT_TRANSPORT_RETRY_SLEEP_SECONDS: u64 = 60;

const ENV_CONFIG_FILE: &str = "THINGCACHE_CONFIG_FILE";
const DEFAULT_CONFIG_FILENAME: &str = ".thingcacheconfig";

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

    #[error("invalid integer '{value}' for key '{key}': {source}")]
    InvalidInteger {
        key: String,
        value: String,
        source: std::num::ParseIntError,
    },

    #[error("invalid boolean '{value}' for key '{key}'")]
    InvalidBoolean { key: String, value: String },

    #[error("invalid conflict resolution '{value}' for key '{key}' (expected create_new or fail)")]
    InvalidResolution { key: String, value: String },

    #[error("invalid override key '{key}': {message}")]
    InvalidOverrideKey { key: String, message: String },
}

/// Result type for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

// =============================================================================
// ConfigSource
// =============================================================================

/// Specifies how to locate and layer configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    /// Explicit config file path from CLI. If specified and doesn't exist, error.
    /// If None, fall back to THINGCACHE_CONFIG_FILE env var, then ~/.thingcacheconfig.
    pub config_file: Option<PathBuf>,

    /// Individual key=value overrides (applied last).
    /// Keys use dot-notation: "cache.path", "sync.batch_size"
    pub overrides: Vec<(String, String)>,
}

// =============================================================================
// Value Parsing
// =============================================================================

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    value.trim().parse().map_err(|e| ConfigError::InvalidInteger {
        key: key.to_string(),
        value: value.to_string(),
        source: e,
    })
}

fn parse_bool_value(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBoolean {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_resolution_value(key: &str, value: &str) -> Result<ConflictResolution> {
    match value.trim().to_lowercase().replace('-', "_").as_str() {
        "create_new" => Ok(ConflictResolution::CreateNew),
        "fail" => Ok(ConflictResolution::Fail),
        _ => Err(ConfigError::InvalidResolution {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Parse a comma-separated string into a Vec of trimmed strings.
fn parse_comma_separated(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Config File Resolution
// =============================================================================

/// Information about how the config file was resolved.
#[derive(Debug)]
struct ResolvedConfigFile {
    /// The path to the config file, if one was found.
    path: Option<PathBuf>,
    /// Warning message if env var pointed to nonexistent file.
    warning: Option<String>,
}

/// Resolve which config file to use based on the ConfigSource and environment.
fn resolve_config_file(source: &ConfigSource) -> Result<ResolvedConfigFile> {
    // If explicit path provided, it must exist
    if let Some(ref path) = source.config_file {
        if path.exists() {
            return Ok(ResolvedConfigFile {
                path: Some(path.clone()),
                warning: None,
            });
        }
        return Err(ConfigError::FileNotFound(path.clone()));
    }

    if let Ok(env_path) = env::var(ENV_CONFIG_FILE) {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Ok(ResolvedConfigFile {
                path: Some(path),
                warning: None,
            });
        }
        // Warn but continue with defaults
        return Ok(ResolvedConfigFile {
            path: None,
            warning: Some(format!(
                "config file specified by {} does not exist: {}",
                ENV_CONFIG_FILE, env_path
            )),
        });
    }

    if let Some(home) = env::var_os("HOME").map(PathBuf::from) {
        let default_path = home.join(DEFAULT_CONFIG_FILENAME);
        if default_path.exists() {
            return Ok(ResolvedConfigFile {
                path: Some(default_path),
                warning: None,
            });
        }
    }

    Ok(ResolvedConfigFile {
        path: None,
        warning: None,
    })
}

// =============================================================================
// Default Config
// =============================================================================

/// Create a Config with all default values.
fn default_config() -> Config {
    Config {
        cache: CacheConfig {
            path: PathBuf::from(DEFAULT_CACHE_PATH),
            no_cache: DEFAULT_CACHE_NO_CACHE,
            type_ids: Vec::new(),
            max_age_seconds: DEFAULT_CACHE_MAX_AGE_SECONDS,
            max_items_in_memory: DEFAULT_MAX_ITEMS_IN_MEMORY,
        },
        sync: SyncConfig {
            interval_seconds: DEFAULT_SYNC_INTERVAL_SECONDS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts_per_change: DEFAULT_MAX_ATTEMPTS_PER_CHANGE,
            retry_delay_ms: DEFAULT_SYNC_RETRY_DELAY_MS,
            lock_retry_count: DEFAULT_LOCK_RETRY_COUNT,
            lock_retry_delay_ms: DEFAULT_LOCK_RETRY_DELAY_MS,
            on_item_key_not_found: ConflictResolution::CreateNew,
            on_version_conflict: ConflictResolution::Fail,
        },
        transport: TransportConfig {
            retry_count: DEFAULT_TRANSPORT_RETRY_COUNT,
            retry_sleep_seconds: DEFAULT_TRANSPORT_RETRY_SLEEP_SECONDS,
        },
    }
}

// =============================================================================
// Setting Application
// =============================================================================

/// Apply one `section.param = value` setting. INI files and command-line
/// overrides both go through here.
fn apply_setting(config: &mut Config, section: &str, param: &str, value: &str) -> Result<()> {
    let key = format!("{}.{}", section, param);
    match (section, param) {
        ("cache", "path") => config.cache.path = PathBuf::from(value.trim()),
        ("cache", "no_cache" | "no-cache") => config.cache.no_cache = parse_bool_value(&key, value)?,
        ("cache", "type_ids") => config.cache.type_ids = parse_comma_separated(value),
        ("cache", "max_age_seconds") => config.cache.max_age_seconds = parse_number(&key, value)?,
        ("cache", "max_items_in_memory") => {
            config.cache.max_items_in_memory = parse_number(&key, value)?
        }

        ("sync", "interval_seconds") => config.sync.interval_seconds = parse_number(&key, value)?,
        ("sync", "batch_size") => config.sync.batch_size = parse_number(&key, value)?,
        ("sync", "max_attempts_per_change") => {
            config.sync.max_attempts_per_change = parse_number(&key, value)?
        }
        ("sync", "retry_delay_ms") => config.sync.retry_delay_ms = parse_number(&key, value)?,
        ("sync", "lock_retry_count") => config.sync.lock_retry_count = parse_number(&key, value)?,
        ("sync", "lock_retry_delay_ms") => {
            config.sync.lock_retry_delay_ms = parse_number(&key, value)?
        }
        ("sync", "on_item_key_not_found") => {
            config.sync.on_item_key_not_found = parse_resolution_value(&key, value)?
        }
        ("sync", "on_version_conflict") => {
            config.sync.on_version_conflict = parse_resolution_value(&key, value)?
        }

        ("transport", "retry_count") => config.transport.retry_count = parse_number(&key, value)?,
        ("transport", "retry_sleep_seconds") => {
            config.transport.retry_sleep_seconds = parse_number(&key, value)?
        }

        _ => {
            return Err(ConfigError::InvalidOverrideKey {
                key,
                message: "unknown parameter".to_string(),
            })
        }
    }
    Ok(())
}

/// Load and parse an INI file.
fn load_ini(path: &Path) -> Result<Ini> {
    let mut ini = Ini::new();
    ini.load(path).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        message: e,
    })?;
    Ok(ini)
}

/// Apply an INI file's contents to a Config, layering on top of existing values.
///
/// Unknown sections are ignored so one file can be shared with other tools;
/// unknown keys inside a known section are errors.
fn apply_ini_to_config(config: &mut Config, ini: &Ini) -> Result<()> {
    let Some(map) = ini.get_map() else {
        return Ok(());
    };
    let mut sections: Vec<_> = map.into_iter().collect();
    sections.sort_by(|a, b| a.0.cmp(&b.0));

    for (section, values) in sections {
        if !matches!(section.as_str(), "cache" | "sync" | "transport") {
            continue;
        }
        let mut values: Vec<_> = values.into_iter().collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        for (param, value) in values {
            if let Some(value) = value {
                apply_setting(config, &section, &param, &value)?;
            }
        }
    }
    Ok(())
}

/// Apply a single key=value override to the config.
fn apply_override(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key.split_once('.') {
        Some((section, param)) => apply_setting(config, section, param, value),
        None => Err(ConfigError::InvalidOverrideKey {
            key: key.to_string(),
            message: "expected section.param".to_string(),
        }),
    }
}

/// Parse a `key=value` override as given on the command line.
pub fn parse_override(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) => Ok((key.trim().to_string(), value.to_string())),
        None => Err(ConfigError::InvalidOverrideKey {
            key: s.to_string(),
            message: "expected key=value".to_string(),
        }),
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

/// Read configuration from the given source.
///
/// Configuration is layered in this order:
/// 1. Built-in defaults
/// 2. Config file (from CLI, env var, or ~/.thingcacheconfig)
/// 3. Individual overrides (applied last)
pub fn read_config(source: &ConfigSource) -> Result<ConfigResult> {
    let mut warnings = Vec::new();
    let mut config = default_config();

    let resolved = resolve_config_file(source)?;
    if let Some(warning) = resolved.warning {
        warnings.push(warning);
    }
    if let Some(ref path) = resolved.path {
        let ini = load_ini(path)?;
        apply_ini_to_config(&mut config, &ini)?;
    }

    for (key, value) in &source.overrides {
        apply_override(&mut config, key, value)?;
    }

    Ok(ConfigResult { config, warnings })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = default_config();
        assert_eq!(config.cache.path, PathBuf::from("/tmp/thingcache"));
        assert!(!config.cache.no_cache);
        assert!(config.cache.type_ids.is_empty());
        assert_eq!(config.sync.batch_size, 250);
        assert_eq!(config.sync.max_attempts_per_change, 3);
        assert_eq!(config.sync.on_item_key_not_found, ConflictResolution::CreateNew);
        assert_eq!(config.sync.on_version_conflict, ConflictResolution::Fail);
        assert_eq!(config.transport.retry_count, 2);
        assert_eq!(config.transport.retry_sleep_seconds, 60);
    }

    #[test]
    fn test_apply_override() {
        let mut config = default_config();
        apply_override(&mut config, "cache.path", "/custom/path").unwrap();
        assert_eq!(config.cache.path, PathBuf::from("/custom/path"));

        apply_override(&mut config, "cache.no_cache", "true").unwrap();
        assert!(config.cache.no_cache);

        apply_override(&mut config, "cache.type_ids", "weight, height,,").unwrap();
        assert_eq!(config.cache.type_ids, vec!["weight", "height"]);

        apply_override(&mut config, "sync.on_version_conflict", "create-new").unwrap();
        assert_eq!(config.sync.on_version_conflict, ConflictResolution::CreateNew);
    }

    #[test]
    fn test_apply_override_errors() {
        let mut config = default_config();
        assert!(matches!(
            apply_override(&mut config, "cache", "x"),
            Err(ConfigError::InvalidOverrideKey { .. })
        ));
        assert!(matches!(
            apply_override(&mut config, "sync.bogus", "1"),
            Err(ConfigError::InvalidOverrideKey { .. })
        ));
        assert!(matches!(
            apply_override(&mut config, "sync.batch_size", "many"),
            Err(ConfigError::InvalidInteger { .. })
        ));
        assert!(matches!(
            apply_override(&mut config, "cache.no_cache", "maybe"),
            Err(ConfigError::InvalidBoolean { .. })
        ));
        assert!(matches!(
            apply_override(&mut config, "sync.on_item_key_not_found", "ignore"),
            Err(ConfigError::InvalidResolution { .. })
        ));
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("sync.batch_size=100").unwrap(),
            ("sync.batch_size".to_string(), "100".to_string())
        );
        assert!(parse_override("sync.batch_size").is_err());
    }

    #[test]
    fn test_parse_ini_config() {
        let mut ini = Ini::new();
        ini.read(
            r#"
[cache]
path = /custom/cache
type_ids = weight,blood-pressure
max_age_seconds = 120

[sync]
batch_size = 100
retry_delay_ms = 10

[transport]
retry_count = 5

[other]
ignored = true
"#
            .to_string(),
        )
        .unwrap();

        let mut config = default_config();
        apply_ini_to_config(&mut config, &ini).unwrap();

        assert_eq!(config.cache.path, PathBuf::from("/custom/cache"));
        assert_eq!(config.cache.type_ids, vec!["weight", "blood-pressure"]);
        assert_eq!(config.cache.max_age_seconds, 120);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.retry_delay_ms, 10);
        assert_eq!(config.sync.interval_seconds, DEFAULT_SYNC_INTERVAL_SECONDS);
        assert_eq!(config.transport.retry_count, 5);
    }

    #[test]
    fn test_read_config_file_then_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config");
        std::fs::write(&path, "[sync]\nbatch_size = 100\ninterval_seconds = 30\n").unwrap();

        let source = ConfigSource {
            config_file: Some(path),
            overrides: vec![("sync.batch_size".to_string(), "7".to_string())],
        };
        let result = read_config(&source).unwrap();
        assert_eq!(result.config.sync.batch_size, 7);
        assert_eq!(result.config.sync.interval_seconds, 30);
    }

    #[test]
    fn test_missing_explicit_config_file() {
        let source = ConfigSource {
            config_file: Some(PathBuf::from("/nonexistent/thingcache/config")),
            ..Default::default()
        };
        assert!(matches!(read_config(&source), Err(ConfigError::FileNotFound(_))));
    }
}
