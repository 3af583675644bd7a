//! Command-line interface for inspecting and maintaining the local thing cache.

pub mod args;
mod command_context;
mod commands;

use clap::{Parser, Subcommand};
use thiserror::Error;

pub use args::{GlobalArgs, OutputSink};
pub use command_context::{create_command_context, CommandContext, CommandContextError};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during CLI execution.
#[derive(Debug, Error)]
pub enum CliError {
    /// Argument processing error.
    #[error("{0}")]
    Args(#[from] args::ArgsError),

    /// Configuration or cache setup error.
    #[error("{0}")]
    Context(#[from] CommandContextError),

    /// Cache error.
    #[error("{0}")]
    Cache(#[from] crate::error::Error),

    /// The record has no cache.
    #[error("no cache for record {0}")]
    UnknownRecord(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for CLI operations.
pub type Result<T> = std::result::Result<T, CliError>;

// =============================================================================
// CLI Definition
// =============================================================================

/// thingcache - inspect and maintain the local health-record thing cache.
#[derive(Parser, Debug)]
#[command(name = "thingcache", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List records that have a cache.
    Records(commands::records::RecordsArgs),

    /// Show the sync status of a record.
    Status(commands::records::StatusArgs),

    /// List the cached things of a record.
    Things(commands::things::ThingsArgs),

    /// List the pending operations of a record.
    Pending(commands::things::PendingArgs),

    /// Put a failed or conflicted operation back in the commit queue.
    Requeue(commands::things::RequeueArgs),

    /// Drop a failed or conflicted operation; the server copy is fetched on the next sync.
    Discard(commands::things::DiscardArgs),

    /// Delete cached data.
    Clear(commands::records::ClearArgs),

    /// Raw key-value access to the cache database.
    #[command(name = "key-value-cache")]
    KeyValueCache {
        #[command(subcommand)]
        command: commands::key_value_cache::KeyValueCacheCommand,
    },
}

// =============================================================================
// CLI Execution
// =============================================================================

impl Cli {
    /// Parse command-line arguments and return the CLI instance.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = create_command_context(&self.global)?;

        match self.command {
            Command::Records(args) => args.run(&ctx).await,
            Command::Status(args) => args.run(&ctx).await,
            Command::Things(args) => args.run(&ctx).await,
            Command::Pending(args) => args.run(&ctx).await,
            Command::Requeue(args) => args.run(&ctx).await,
            Command::Discard(args) => args.run(&ctx).await,
            Command::Clear(args) => args.run(&ctx).await,
            Command::KeyValueCache { command } => command.run(&ctx).await,
        }
    }
}

/// Main entry point for the CLI.
pub async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Thing, ThingKey};
    use crate::store::{LocalVault, RecordCacheSettings};
    use chrono::Utc;
    use tempfile::TempDir;

    fn cli(temp_dir: &TempDir, args: &[&str]) -> Cli {
        let cache = temp_dir.path().join("cache");
        let config = temp_dir.path().join("config");
        std::fs::write(&config, "[cache]\ntype_ids = weight\n").unwrap();
        let mut argv = vec![
            "thingcache".to_string(),
            "--config-file".to_string(),
            config.display().to_string(),
            "--cache-path".to_string(),
            cache.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn test_discard_marks_thing_stale() {
        let temp_dir = TempDir::new().unwrap();
        let op = {
            let vault =
                LocalVault::open(&temp_dir.path().join("cache"), RecordCacheSettings::default())
                    .unwrap();
            vault
                .setup_cache_for_record_ids(&["r1".to_string()])
                .await
                .unwrap();
            let cache = vault.record_cache("r1");
            let thing = Thing::new(ThingKey::new("a", "1"), "weight", Utc::now(), "{}");
            let mut op = cache.track_put(thing).await.unwrap();
            op.state = crate::model::PendingState::Conflict {
                reason: "version mismatch".to_string(),
            };
            cache.pending().put(&op).await.unwrap();
            op
        };

        let id = op.identifier.to_string();
        cli(&temp_dir, &["discard", "r1", &id]).run().await.unwrap();
        assert!(matches!(
            cli(&temp_dir, &["discard", "r1", &id]).run().await,
            Err(CliError::Other(_))
        ));

        let out = temp_dir.path().join("out");
        let out_arg = out.display().to_string();
        cli(&temp_dir, &["--json", "status", "r1", "-o", &out_arg])
            .run()
            .await
            .unwrap();
        let status: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(status["pending"], 0);
        assert_eq!(status["stale_ids"][0], "a");
    }

    #[tokio::test]
    async fn test_requeue_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("out");

        let op = {
            let vault =
                LocalVault::open(&temp_dir.path().join("cache"), RecordCacheSettings::default())
                    .unwrap();
            vault
                .setup_cache_for_record_ids(&["r1".to_string()])
                .await
                .unwrap();
            let cache = vault.record_cache("r1");
            let thing = Thing::new(ThingKey::new("a", "1"), "weight", Utc::now(), "{}");
            let mut op = cache.track_put(thing).await.unwrap();
            op.state = crate::model::PendingState::Failed {
                reason: "denied".to_string(),
            };
            cache.pending().put(&op).await.unwrap();
            op
        };

        let id = op.identifier.to_string();
        cli(&temp_dir, &["requeue", "r1", &id]).run().await.unwrap();
        assert!(matches!(
            cli(&temp_dir, &["requeue", "r1", &id]).run().await,
            Err(CliError::Other(_))
        ));
        assert!(matches!(
            cli(&temp_dir, &["status", "r2"]).run().await,
            Err(CliError::UnknownRecord(_))
        ));

        let out_arg = out.display().to_string();
        cli(&temp_dir, &["--json", "pending", "r1", "-o", &out_arg])
            .run()
            .await
            .unwrap();
        let listed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(listed[0]["state"], "Queued");
        assert_eq!(listed[0]["version"], 0);

        cli(&temp_dir, &["clear", "--all"]).run().await.unwrap();
        cli(&temp_dir, &["--json", "records", "-o", &out_arg])
            .run()
            .await
            .unwrap();
        let listed: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert!(listed.is_empty());
    }
}
