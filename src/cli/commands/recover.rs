//! Implementation of the `taskwire recover` command.

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::broadcast;

use crate::cli::commands::CommandContext;
use crate::cli::output::{output, CommandOutput};
use crate::services::{RecoveryReport, RecoveryService};

#[derive(Args, Debug)]
pub struct RecoverArgs {
    /// Keep sweeping on the configured interval until interrupted
    #[arg(long)]
    pub watch: bool,
}

impl CommandOutput for RecoveryReport {
    fn to_human(&self) -> String {
        if self.is_empty() {
            return "Recovery pass complete: nothing to do.".to_string();
        }
        let mut lines = vec![format!("Recovery pass complete: {} change(s).", self.total_changes())];
        let sections = [
            ("Machines marked offline", self.machines_marked_offline.clone()),
            ("Tasks re-queued from offline machines", ids(&self.tasks_requeued)),
            ("Tasks timed out", ids(&self.tasks_timed_out)),
            ("Stale tasks failed", ids(&self.tasks_failed_stale)),
            ("Expired claims re-queued", ids(&self.claims_requeued)),
        ];
        for (label, items) in sections {
            if !items.is_empty() {
                lines.push(format!("  {label}:"));
                lines.extend(items.into_iter().map(|item| format!("    - {item}")));
            }
        }
        lines.join("\n")
    }
}

fn ids(ids: &[uuid::Uuid]) -> Vec<String> {
    ids.iter().map(ToString::to_string).collect()
}

pub async fn execute(args: RecoverArgs, json_mode: bool) -> Result<()> {
    let ctx = CommandContext::load().await?;
    let service = RecoveryService::new(ctx.store, ctx.registry, ctx.config.recovery.clone());

    if !args.watch {
        let report = service.run_once().await.context("Recovery pass failed")?;
        output(&report, json_mode);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = service.start(shutdown_rx);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    shutdown_tx.send(()).ok();
    handle.await.ok();
    Ok(())
}
