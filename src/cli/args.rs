//! Command-line argument definitions and helpers.

use std::path::PathBuf;

use clap::Args;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::{parse_override, ConfigSource};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during argument processing.
#[derive(Debug, Error)]
pub enum ArgsError {
    /// I/O error reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid argument combination.
    #[error("{0}")]
    InvalidArgs(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for argument operations.
pub type Result<T> = std::result::Result<T, ArgsError>;

// =============================================================================
// Global Arguments
// =============================================================================

/// Global arguments that apply to all commands.
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Path to the configuration file.
    #[arg(long = "config-file", global = true)]
    pub config_file: Option<PathBuf>,

    /// Configuration overrides in the form section.name=value.
    #[arg(long = "config", value_parser = parse_config_override, global = true)]
    pub config_overrides: Vec<(String, String)>,

    /// Format output as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Directory of the cache database, overriding cache.path.
    #[arg(long = "cache-path", global = true)]
    pub cache_path: Option<PathBuf>,
}

impl GlobalArgs {
    /// Convert to a ConfigSource for reading configuration.
    pub fn to_config_source(&self) -> ConfigSource {
        let mut overrides = self.config_overrides.clone();
        if let Some(path) = &self.cache_path {
            overrides.push(("cache.path".to_string(), path.display().to_string()));
        }
        ConfigSource {
            config_file: self.config_file.clone(),
            overrides,
        }
    }
}

fn parse_config_override(s: &str) -> std::result::Result<(String, String), String> {
    parse_override(s).map_err(|e| e.to_string())
}

// =============================================================================
// Output Helpers
// =============================================================================

/// Helper for commands that write output to a file or stdout.
#[derive(Args, Debug, Default)]
pub struct OutputSink {
    /// Write output to this file instead of stdout.
    #[arg(id = "output_file", short = 'o', long = "output-file")]
    pub file: Option<PathBuf>,
}

impl OutputSink {
    /// Write a string value to the output.
    pub async fn write_str(&self, value: &str) -> Result<()> {
        match &self.file {
            Some(path) => {
                tokio::fs::write(path, value).await?;
            }
            None => {
                tokio::io::stdout().write_all(value.as_bytes()).await?;
                tokio::io::stdout().write_all(b"\n").await?;
            }
        }
        Ok(())
    }

    /// Write `value` as pretty JSON when `json` is set, else write `text`.
    pub async fn write<T: serde::Serialize>(&self, value: &T, text: &str, json: bool) -> Result<()> {
        if json {
            self.write_str(&serde_json::to_string_pretty(value)?).await
        } else {
            self.write_str(text).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cache_path_becomes_override() {
        let args = GlobalArgs {
            config_overrides: vec![("sync.batch_size".to_string(), "5".to_string())],
            cache_path: Some(PathBuf::from("/data/cache")),
            ..Default::default()
        };
        let source = args.to_config_source();
        assert_eq!(source.overrides.len(), 2);
        assert_eq!(source.overrides[1], ("cache.path".to_string(), "/data/cache".to_string()));
    }

    #[test]
    fn test_parse_config_override() {
        assert!(parse_config_override("cache.path=/x").is_ok());
        assert!(parse_config_override("cache.path").is_err());
    }

    #[tokio::test]
    async fn test_output_sink_writes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.json");
        let sink = OutputSink {
            file: Some(path.clone()),
        };
        sink.write(&vec!["a", "b"], "a\nb", true).await.unwrap();
        let written: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, vec!["a", "b"]);

        sink.write(&vec!["a"], "plain", false).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "plain");
    }
}
