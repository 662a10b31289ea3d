//! Gateway command.

use clap::Args;
use fleetlink_core::config::{BindMode, Config};
use fleetlink_gateway::{Gateway, ShutdownOutcome};
use std::net::TcpStream;
use std::path::Path;
use tracing::{error, info};

/// Gateway command arguments.
#[derive(Args)]
pub struct GatewayArgs {
    #[command(subcommand)]
    pub command: GatewayCommand,
}

#[derive(clap::Subcommand)]
pub enum GatewayCommand {
    /// Start the gateway server
    Run(RunArgs),

    /// Show gateway status
    Status,
}

/// Overrides applied on top of the config file.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Bind mode (loopback, lan, auto)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// HTTP API port
    #[arg(short, long, env = "FLEETLINK_PORT")]
    pub port: Option<u16>,

    /// Realtime WebSocket port
    #[arg(long, env = "FLEETLINK_REALTIME_PORT")]
    pub realtime_port: Option<u16>,

    /// Token required on API and realtime requests
    #[arg(long, env = "FLEETLINK_AUTH_TOKEN")]
    pub auth_token: Option<String>,
}

impl RunArgs {
    /// Fold the command-line overrides into `config`.
    pub fn apply(self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(bind) = self.bind {
            config.gateway.bind = BindMode::parse(&bind)
                .ok_or_else(|| anyhow::anyhow!("Invalid bind mode: {}", bind))?;
        }
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if let Some(port) = self.realtime_port {
            config.gateway.realtime_port = port;
        }
        if let Some(token) = self.auth_token.filter(|t| !t.is_empty()) {
            config.gateway.auth_token = Some(token);
        }
        Ok(())
    }
}

/// Run the gateway command.
pub async fn run(args: GatewayArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    match args.command {
        GatewayCommand::Run(overrides) => {
            let mut config = Config::load_from(config_path)?;
            overrides.apply(&mut config)?;
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

            info!(
                "Starting gateway (api port {}, realtime port {}, {} robots)",
                config.gateway.port,
                config.gateway.realtime_port,
                config.robots.len()
            );

            let gateway = Gateway::from_config(config).await;
            match gateway.run(shutdown_signal()).await? {
                ShutdownOutcome::Completed { sessions_ended } => {
                    info!("Gateway stopped, {} sessions ended", sessions_ended);
                }
                ShutdownOutcome::DeadlineExceeded => {
                    error!("Shutdown deadline exceeded, exiting");
                    std::process::exit(1);
                }
            }
        }

        GatewayCommand::Status => {
            let config = Config::load_from(config_path)?;
            for (label, port) in [
                ("API", config.gateway.port),
                ("Realtime", config.gateway.realtime_port),
            ] {
                match TcpStream::connect(("127.0.0.1", port)) {
                    Ok(_) => println!("{} listener is running on port {}", label, port),
                    Err(_) => println!("{} listener is not running (port {})", label, port),
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
