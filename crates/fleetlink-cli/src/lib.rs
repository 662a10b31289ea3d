//! FleetLink command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// FleetLink - direct-control gateway for robot fleets
#[derive(Parser)]
#[command(name = "fleetlink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file
    #[arg(short, long, env = "FLEETLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run or inspect the gateway
    Gateway(commands::gateway::GatewayArgs),

    /// Configuration management
    Config(commands::config::ConfigArgs),

    /// Show version information
    Version,
}

/// Run the CLI with the given arguments.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config;
    match cli.command {
        Commands::Gateway(args) => commands::gateway::run(args, config_path.as_deref()).await,
        Commands::Config(args) => commands::config::run(args, config_path.as_deref()).await,
        Commands::Version => {
            println!("fleetlink {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
