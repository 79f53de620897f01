mod cli;
mod config;
mod distributor;
mod drivers;
mod error;
mod health;
mod proto;
mod reading;
mod sinks;
mod supervisor;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match supervisor::Supervisor::bootstrap(cli.config.clone(), cli.enable_management_api).await {
        Ok(sup) => {
            tracing::info!(config = %cli.config.display(), "weather-relay started");
            sup.run_until_shutdown().await
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    }
}
