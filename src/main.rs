use anyhow::Result;
use btcrate::core::log::init_logging;
use clap::{CommandFactory, Parser, Subcommand};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl From<Commands> for btcrate::AppCommand {
    fn from(cmd: Commands) -> btcrate::AppCommand {
        match cmd {
            Commands::Watch => btcrate::AppCommand::Watch,
            Commands::Refresh => btcrate::AppCommand::Refresh,
            Commands::ClearCache => btcrate::AppCommand::ClearCache,
            Commands::Setup => unreachable!("Setup command should be handled separately"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Refresh the BTC rate on a schedule and print every change
    Watch,
    /// Fetch the BTC rate once
    Refresh,
    /// Remove the cached BTC rate
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => btcrate::cli::setup::setup(),
        Some(cmd) => btcrate::run_command(cmd.into(), cli.config_path.as_deref()).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}
