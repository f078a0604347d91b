//! taskwire CLI entry point.

use clap::Parser;

use taskwire::cli::{commands, handle_error, Cli, Commands};
use taskwire::infrastructure::config::ConfigLoader;
use taskwire::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging follows the project config when it loads; defaults otherwise so
    // that `init` works in an empty directory.
    let log_config = ConfigLoader::load()
        .map(|config| LogConfig::from(&config.logging))
        .unwrap_or_default();
    let _logger = match LoggerImpl::init(&log_config) {
        Ok(logger) => Some(logger),
        Err(e) => {
            eprintln!("warning: logging disabled: {e:#}");
            None
        }
    };

    let result = match cli.command {
        Commands::Init(args) => commands::init::execute(args, cli.json).await,
        Commands::Task(args) => commands::task::execute(args, cli.json).await,
        Commands::Machine(args) => commands::machine::execute(args, cli.json).await,
        Commands::Worker(args) => commands::worker::execute(args, cli.json).await,
        Commands::Recover(args) => commands::recover::execute(args, cli.json).await,
    };

    if let Err(err) = result {
        handle_error(err, cli.json);
    }
}
