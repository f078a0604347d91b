//! Implementation of the `taskwire machine` commands.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::commands::CommandContext;
use crate::cli::output::{format_machine_table, format_time, output, CommandOutput};
use crate::domain::models::{Heartbeat, Machine};

#[derive(Args, Debug)]
pub struct MachineArgs {
    #[command(subcommand)]
    pub command: MachineCommands,
}

#[derive(Subcommand, Debug)]
pub enum MachineCommands {
    /// List registered machines
    List,

    /// Send one heartbeat for this machine, registering it if new
    Heartbeat {
        /// Machine id (defaults to worker.machine_id, then the host name)
        #[arg(long)]
        machine_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct MachineListOutput {
    pub machines: Vec<Machine>,
}

impl CommandOutput for MachineListOutput {
    fn to_human(&self) -> String {
        if self.machines.is_empty() {
            return "No machines registered.".to_string();
        }
        format_machine_table(&self.machines, Utc::now())
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.machines).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct HeartbeatOutput {
    pub machine: Machine,
}

impl CommandOutput for HeartbeatOutput {
    fn to_human(&self) -> String {
        format!(
            "Heartbeat recorded for {} ({}) at {}",
            self.machine.id,
            self.machine.status,
            format_time(&self.machine.last_heartbeat)
        )
    }
}

pub async fn execute(args: MachineArgs, json_mode: bool) -> Result<()> {
    let ctx = CommandContext::load().await?;

    match args.command {
        MachineCommands::List => {
            let machines = ctx.registry.list().await.context("Failed to list machines")?;
            output(&MachineListOutput { machines }, json_mode);
        }
        MachineCommands::Heartbeat { machine_id } => {
            let worker = &ctx.config.worker;
            let machine_id = machine_id.unwrap_or_else(|| worker.resolved_machine_id());
            // A manual heartbeat reports no running sessions.
            let heartbeat = Heartbeat::from_load(
                machine_id,
                0,
                worker.max_concurrency,
                worker.engine_priority.clone(),
            );
            let machine = ctx
                .registry
                .heartbeat(&heartbeat)
                .await
                .context("Failed to record heartbeat")?;
            output(&HeartbeatOutput { machine }, json_mode);
        }
    }
    Ok(())
}
