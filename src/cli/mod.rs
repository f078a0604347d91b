//! Command-line interface.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use commands::init::InitArgs;
use commands::machine::MachineArgs;
use commands::recover::RecoverArgs;
use commands::task::TaskArgs;
use commands::worker::WorkerArgs;

#[derive(Parser, Debug)]
#[command(name = "taskwire")]
#[command(about = "Distributed task dispatch with interactive engine sessions", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create .taskwire/ with a default config and a migrated database
    Init(InitArgs),

    /// Submit, inspect and cancel tasks
    Task(TaskArgs),

    /// Inspect registered machines
    Machine(MachineArgs),

    /// Run a worker on this machine
    Worker(WorkerArgs),

    /// Recover stale machines and tasks
    Recover(RecoverArgs),
}

/// Print `err` (with its cause chain) and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let causes: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let body = serde_json::json!({
            "error": err.to_string(),
            "causes": causes,
        });
        eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err}");
        for cause in err.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
    }
    std::process::exit(1);
}
