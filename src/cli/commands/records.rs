//! Record-level subcommands: list, status, clear.

use clap::Args;
use serde::Serialize;

use crate::cli::{CliError, CommandContext, OutputSink, Result};
use crate::store::CacheStatus;

// =============================================================================
// Records
// =============================================================================

/// Arguments for the records command.
#[derive(Args, Debug)]
pub struct RecordsArgs {
    #[command(flatten)]
    pub output: OutputSink,
}

impl RecordsArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let record_ids = ctx.vault.cached_record_ids().await?;
        self.output
            .write(&record_ids, &record_ids.join("\n"), ctx.json)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Record whose sync status to show.
    pub record_id: String,

    #[command(flatten)]
    pub output: OutputSink,
}

#[derive(Serialize)]
struct StatusOutput {
    record_id: String,
    #[serde(flatten)]
    status: CacheStatus,
    consistent: bool,
    things: usize,
    pending: usize,
}

fn format_date(date: Option<chrono::DateTime<chrono::Utc>>) -> String {
    date.map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "never".to_string())
}

impl StatusArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let cache = ctx
            .existing_record(&self.record_id)
            .await?
            .ok_or_else(|| CliError::UnknownRecord(self.record_id.clone()))?;
        let status = cache.status().await?;
        let output = StatusOutput {
            record_id: self.record_id.clone(),
            consistent: status.is_consistent(),
            things: cache.things().all_keys().await?.len(),
            pending: cache.pending().len().await?,
            status,
        };

        let text = format!(
            "record:            {}\n\
             valid:             {}\n\
             consistent:        {}\n\
             last sync:         {}\n\
             last consistency:  {}\n\
             cache sequence:    {}\n\
             server sequence:   {}\n\
             things:            {}\n\
             pending:           {}\n\
             stale:             {}",
            output.record_id,
            output.status.is_valid,
            output.consistent,
            format_date(output.status.last_sync_date),
            format_date(output.status.last_consistency_date),
            output.status.newest_cache_sequence_number,
            output.status.newest_health_vault_sequence_number,
            output.things,
            output.pending,
            output.status.stale_ids.len(),
        );
        self.output.write(&output, &text, ctx.json).await?;
        Ok(())
    }
}

// =============================================================================
// Clear
// =============================================================================

/// Arguments for the clear command.
#[derive(Args, Debug)]
pub struct ClearArgs {
    /// Record to clear. Clears every record when omitted together with --all.
    pub record_id: Option<String>,

    /// Clear every record.
    #[arg(long, conflicts_with = "record_id")]
    pub all: bool,

    /// Drop cached things and sync state but keep pending operations.
    #[arg(long = "keep-pending")]
    pub keep_pending: bool,
}

impl ClearArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let record_ids = match (&self.record_id, self.all) {
            (Some(record_id), false) => vec![record_id.clone()],
            (None, true) => ctx.vault.cached_record_ids().await?,
            _ => {
                return Err(CliError::Other(
                    "specify a record id or --all".to_string(),
                ))
            }
        };

        for record_id in &record_ids {
            if self.keep_pending {
                ctx.vault.record_cache(record_id).reset().await?;
            } else {
                ctx.vault.delete_cache_for_record(record_id).await?;
            }
        }
        Ok(())
    }
}
