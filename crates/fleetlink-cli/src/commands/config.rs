//! Configuration management commands.

use clap::Args;
use fleetlink_core::config::Config;
use fleetlink_core::paths;
use std::path::{Path, PathBuf};

/// Config command arguments.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(clap::Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration
    Validate,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show => {
            let mut config = Config::load_from(config_path)?;
            if config.gateway.auth_token.is_some() {
                config.gateway.auth_token = Some("********".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        ConfigCommand::Init { force } => {
            let path = resolve(config_path)?;
            init(&path, force)?;
            println!("Created config file: {}", path.display());
        }

        ConfigCommand::Path => {
            println!("{}", resolve(config_path)?.display());
        }

        ConfigCommand::Validate => {
            let path = resolve(config_path)?;
            let config = Config::load(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            match config.validate() {
                Ok(()) => println!(
                    "Configuration is valid ({} robots registered)",
                    config.robots.len()
                ),
                Err(e) => anyhow::bail!("Configuration error: {}", e),
            }
        }
    }

    Ok(())
}

fn resolve(config_path: Option<&Path>) -> anyhow::Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(paths::config_file()?),
    }
}

/// Write the default configuration to `path`.
pub fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            path.display()
        );
    }
    Config::default().save(path)?;
    Ok(())
}
