//! Subcommands that inspect cached things and pending operations.

use clap::Args;
use serde::Serialize;
use uuid::Uuid;

use crate::cli::{CliError, CommandContext, OutputSink, Result};
use crate::model::{PendingState, Thing};

// =============================================================================
// Things
// =============================================================================

/// Arguments for the things command.
#[derive(Args, Debug)]
pub struct ThingsArgs {
    pub record_id: String,

    /// Only list things of this type id.
    #[arg(long = "type")]
    pub type_id: Option<String>,

    /// Include payloads in the output.
    #[arg(long)]
    pub full: bool,

    #[command(flatten)]
    pub output: OutputSink,
}

#[derive(Serialize)]
struct ThingLine {
    id: String,
    version: String,
    type_name: String,
    effective_date: String,
    placeholder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

impl ThingsArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let cache = ctx
            .existing_record(&self.record_id)
            .await?
            .ok_or_else(|| CliError::UnknownRecord(self.record_id.clone()))?;

        let mut things: Vec<Thing> = cache
            .things()
            .all_items()
            .await?
            .into_iter()
            .filter(|t| self.type_id.as_ref().map_or(true, |type_id| &t.type_id == type_id))
            .collect();
        things.sort_by(|a, b| {
            b.effective_date
                .cmp(&a.effective_date)
                .then_with(|| a.key.id.cmp(&b.key.id))
        });

        let lines: Vec<ThingLine> = things
            .into_iter()
            .map(|t| ThingLine {
                type_name: ctx.registry.name_for(&t.type_id),
                effective_date: t.effective_date.to_rfc3339(),
                placeholder: t.is_placeholder,
                payload: self.full.then(|| t.payload.clone()),
                id: t.key.id,
                version: t.key.version,
            })
            .collect();

        let text = lines
            .iter()
            .map(|l| {
                let mut line = format!(
                    "{}  {}  {}{}",
                    l.effective_date,
                    l.id,
                    l.type_name,
                    if l.placeholder { "  (not downloaded)" } else { "" }
                );
                if let Some(payload) = &l.payload {
                    line.push_str("  ");
                    line.push_str(payload);
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.output.write(&lines, &text, ctx.json).await?;
        Ok(())
    }
}

// =============================================================================
// Pending
// =============================================================================

/// Arguments for the pending command.
#[derive(Args, Debug)]
pub struct PendingArgs {
    pub record_id: String,

    #[command(flatten)]
    pub output: OutputSink,
}

fn describe_state(state: &PendingState) -> String {
    match state {
        PendingState::Queued => "queued".to_string(),
        PendingState::Failed { reason } => format!("failed: {}", reason),
        PendingState::Conflict { reason } => format!("conflict: {}", reason),
    }
}

impl PendingArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let cache = ctx
            .existing_record(&self.record_id)
            .await?
            .ok_or_else(|| CliError::UnknownRecord(self.record_id.clone()))?;
        let ops = cache.pending().list().await?;

        let text = ops
            .iter()
            .map(|op| {
                format!(
                    "{}  {:?}  {}  {}  attempts={}  {}",
                    op.identifier,
                    op.method_name,
                    ctx.registry.name_for(&op.type_id),
                    op.thing_id,
                    op.version,
                    describe_state(&op.state)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.output.write(&ops, &text, ctx.json).await?;
        Ok(())
    }
}

// =============================================================================
// Requeue
// =============================================================================

/// Arguments for the requeue command.
#[derive(Args, Debug)]
pub struct RequeueArgs {
    pub record_id: String,

    /// Identifier of the failed or conflicted operation.
    pub identifier: Uuid,
}

impl RequeueArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let cache = ctx
            .existing_record(&self.record_id)
            .await?
            .ok_or_else(|| CliError::UnknownRecord(self.record_id.clone()))?;
        if !cache.requeue(&self.identifier).await? {
            return Err(CliError::Other(format!(
                "no failed or conflicted operation {}",
                self.identifier
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Discard
// =============================================================================

/// Arguments for the discard command.
#[derive(Args, Debug)]
pub struct DiscardArgs {
    pub record_id: String,

    /// Identifier of the failed or conflicted operation.
    pub identifier: Uuid,
}

impl DiscardArgs {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let cache = ctx
            .existing_record(&self.record_id)
            .await?
            .ok_or_else(|| CliError::UnknownRecord(self.record_id.clone()))?;
        if !cache.discard(&self.identifier).await? {
            return Err(CliError::Other(format!(
                "no failed or conflicted operation {}",
                self.identifier
            )));
        }
        Ok(())
    }
}
