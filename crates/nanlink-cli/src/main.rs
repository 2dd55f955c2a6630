//! nanlink CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;

use nanlink_cli::{cli::Cli, commands::CommandDispatcher, config::CliConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = load_configuration(&cli)?;
    config
        .apply_env()
        .context("Invalid NANLINK_ environment override")?;
    config.apply_flags(cli.port, cli.service.as_deref());
    config.validate().context("Invalid configuration")?;

    CommandDispatcher::execute(cli, config)
        .await
        .context("Command execution failed")?;

    info!("nanlink exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> anyhow::Result<CliConfig> {
    match &cli.config {
        Some(path) => CliConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None => {
            info!("Using default configuration");
            Ok(CliConfig::default())
        }
    }
}
