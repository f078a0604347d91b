//! Implementation of the `taskwire init` command.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;

use crate::cli::output::{output, CommandOutput};
use crate::infrastructure::setup::{
    create_config_file, create_directories, initialize_project_database, SetupPaths,
};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config file with the defaults
    #[arg(long, short)]
    pub force: bool,

    /// Target directory (defaults to current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub message: String,
    pub initialized_path: PathBuf,
    pub directories_created: Vec<String>,
    pub config_written: bool,
    pub database_path: PathBuf,
}

impl CommandOutput for InitOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![self.message.clone()];
        if !self.directories_created.is_empty() {
            lines.push("\nCreated directories:".to_string());
            for dir in &self.directories_created {
                lines.push(format!("  - {dir}"));
            }
        }
        if self.config_written {
            lines.push("\nWrote .taskwire/config.yaml".to_string());
        }
        lines.push(format!("Database ready at {}", self.database_path.display()));
        lines.join("\n")
    }
}

pub async fn execute(args: InitArgs, json_mode: bool) -> Result<()> {
    let target_path = if args.path.is_absolute() {
        args.path.clone()
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&args.path)
    };
    let paths = SetupPaths::for_root(&target_path);
    let already = paths.is_initialized();

    let directories_created = create_directories(&paths)?
        .into_iter()
        .map(|dir| {
            dir.strip_prefix(&target_path)
                .unwrap_or(&dir)
                .to_string_lossy()
                .to_string()
        })
        .collect();
    let config_written = create_config_file(&paths, args.force)?;
    initialize_project_database(&paths).await?;

    let message = match (already, args.force) {
        (true, true) => "Project reinitialized.",
        (true, false) => "Project already initialized; database migrations are up to date.",
        _ => "Project initialized successfully.",
    };

    let output_data = InitOutput {
        success: true,
        message: message.to_string(),
        initialized_path: target_path,
        directories_created,
        config_written,
        database_path: paths.database_file,
    };
    output(&output_data, json_mode);
    Ok(())
}
