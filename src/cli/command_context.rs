//! Command context for CLI commands.
//!
//! Reads the configuration and opens the local cache database the commands
//! operate on.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::{read_config, ConfigError, ConfigHelper};
use crate::model::ThingTypeRegistry;
use crate::store::{LocalVault, RecordCache};

use super::GlobalArgs;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during command context creation.
#[derive(Debug, Error)]
pub enum CommandContextError {
    /// Caching is turned off in the configuration.
    #[error("caching is disabled (cache.no_cache)")]
    CacheDisabled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The cache database could not be opened.
    #[error("cannot open cache at {path}: {source}")]
    Open {
        path: String,
        source: crate::error::Error,
    },
}

/// Result type for command context operations.
pub type Result<T> = std::result::Result<T, CommandContextError>;

// =============================================================================
// CommandContext
// =============================================================================

/// Everything a command needs, resolved from the global arguments.
pub struct CommandContext {
    pub helper: ConfigHelper,
    pub vault: Arc<LocalVault>,
    pub registry: ThingTypeRegistry,
    pub json: bool,
}

impl CommandContext {
    /// The cache of `record_id`. Commands do not create caches for unknown records.
    pub async fn existing_record(&self, record_id: &str) -> crate::error::Result<Option<Arc<RecordCache>>> {
        let known = self.vault.cached_record_ids().await?;
        Ok(known
            .iter()
            .any(|id| id == record_id)
            .then(|| self.vault.record_cache(record_id)))
    }
}

/// Read configuration and open the cache database.
pub fn create_command_context(global: &GlobalArgs) -> Result<CommandContext> {
    let result = read_config(&global.to_config_source())?;
    for warning in &result.warnings {
        tracing::warn!("{}", warning);
    }
    let helper = ConfigHelper::new(result.config);
    if helper.config().cache.no_cache {
        return Err(CommandContextError::CacheDisabled);
    }

    let path = helper.config().cache.path.clone();
    debug!(path = %path.display(), "opening cache");
    let vault = LocalVault::open(&path, helper.record_cache_settings()).map_err(|source| {
        CommandContextError::Open {
            path: path.display().to_string(),
            source,
        }
    })?;

    Ok(CommandContext {
        helper,
        vault: Arc::new(vault),
        registry: ThingTypeRegistry::with_defaults(),
        json: global.json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn global_for(temp_dir: &TempDir) -> GlobalArgs {
        GlobalArgs {
            config_file: Some(temp_dir.path().join("config")),
            cache_path: Some(temp_dir.path().join("cache")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_context_opens_cache_under_configured_path() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("config"), "[cache]\ntype_ids = weight\n").unwrap();

        let ctx = create_command_context(&global_for(&temp_dir)).unwrap();
        assert!(ctx.helper.caching_enabled());
        assert!(ctx.existing_record("r1").await.unwrap().is_none());

        ctx.vault
            .setup_cache_for_record_ids(&["r1".to_string()])
            .await
            .unwrap();
        assert!(ctx.existing_record("r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_cache_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("config"), "[cache]\nno_cache = true\n").unwrap();
        assert!(matches!(
            create_command_context(&global_for(&temp_dir)),
            Err(CommandContextError::CacheDisabled)
        ));
    }
}
