use clap::{Parser, Subcommand};
use std::process;

use lmvisor::cmd;

#[derive(Parser)]
#[command(name = "lmvisor")]
#[command(version)]
#[command(about = "Supervise local llama-server model instances", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and its control API (default)
    Serve,
    /// List models known to a running supervisor
    #[command(alias = "ls")]
    Models,
    /// Rescan the model directory
    Reload,
    /// Show loaded models
    #[command(alias = "ps")]
    Status,
    /// Load a model by its index
    Load {
        #[arg(allow_negative_numbers = true)]
        index: i64,
    },
    /// Stop one instance, or all of them
    #[command(alias = "stop")]
    Unload {
        #[arg(short, long)]
        instance: Option<u64>,
    },
    /// Show recent lifecycle events
    Events,
    /// Check that the control API answers
    Health,
    /// Write the default config file
    Init {
        #[arg(short, long)]
        force: bool,
    },
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cmd::init_logging();

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd::serve().await,
        Commands::Models => cmd::models().await,
        Commands::Reload => cmd::reload().await,
        Commands::Status => cmd::status().await,
        Commands::Load { index } => cmd::load(index).await,
        Commands::Unload { instance } => cmd::unload(instance).await,
        Commands::Events => cmd::events().await,
        Commands::Health => cmd::health().await,
        Commands::Init { force } => cmd::init_config(force).await,
        Commands::Version => cmd::version().await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
