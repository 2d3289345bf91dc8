use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod config;
mod logger;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = config::Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        config::Commands::Up { file, services } => commands::up::run(file, services).await,
        config::Commands::Status { file, json } => commands::status::run(file, json).await,
        config::Commands::Port { from } => commands::port::run(from),
    }
}
