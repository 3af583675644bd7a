//! Raw key-value inspection of the cache database.

use clap::{Args, Subcommand};

use crate::cli::{CommandContext, OutputSink, Result};

/// Key-value cache subcommands.
#[derive(Subcommand, Debug)]
pub enum KeyValueCacheCommand {
    /// List entries in the cache.
    #[command(name = "list-entries")]
    ListEntries(ListEntriesArgs),
}

impl KeyValueCacheCommand {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        match self {
            KeyValueCacheCommand::ListEntries(args) => args.run(ctx).await,
        }
    }
}

/// Arguments for the list-entries command.
#[derive(Args, Debug)]
pub struct ListEntriesArgs {
    /// Optional prefix to filter entries, e.g. `rec/r1/pending/`.
    pub prefix: Option<String>,

    #[command(flatten)]
    pub output: OutputSink,
}

impl ListEntriesArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let prefix = self.prefix.as_deref().unwrap_or("");
        let entries = ctx.vault.db().list_entries(prefix.as_bytes()).await.map_err(crate::Error::from)?;

        let output = entries
            .iter()
            .map(|entry| {
                format!(
                    "{} -> {}",
                    String::from_utf8_lossy(&entry.key),
                    String::from_utf8_lossy(&entry.value)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        if !output.is_empty() {
            self.output.write_str(&output).await?;
        }
        Ok(())
    }
}
