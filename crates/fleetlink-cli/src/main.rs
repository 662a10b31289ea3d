//! FleetLink CLI entry point.

use clap::Parser;
use fleetlink_cli::{run, Cli};
use fleetlink_core::config::{Config, LogFormat};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file unless RUST_LOG or -v override them
    let logging = Config::load_from(cli.config.as_deref())
        .map(|config| config.logging)
        .unwrap_or_default();
    let level = match cli.verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("fleetlink={level},tower_http={level}").into());

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    run(cli).await
}
