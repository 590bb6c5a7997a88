//! Anomaly query service - command line entry point
//!
//! This is the main entry point for the `aq` binary.

use anyhow::Result;
use aq_cli::Cli;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // Set up logging based on verbosity, then the configured level
    let level = if cli.verbose {
        "debug"
    } else {
        config.global.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so stdout stays machine-readable
    let registry = tracing_subscriber::registry().with(filter);
    if config.global.json_logs {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    cli.run_with_config(config).await?;

    Ok(())
}
