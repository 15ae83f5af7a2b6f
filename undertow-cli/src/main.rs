//! Undertow CLI - Command-line demo
//!
//! Drives the alert pipeline and piece scheduler against a simulated engine.

mod commands;

use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Async alert fan-out and piece scheduling for a torrent engine")]
struct Cli {
    /// Console log level (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "info")]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command).await
}
