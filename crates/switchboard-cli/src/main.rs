//! Switchboard command-line entry point.
//!
//! Binary name: `swb`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the command
//! handler: configuration checks, breaker inspection, or a simulated
//! dispatch workload.

mod cli;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use switchboard_infra::config::default_config_path;
use switchboard_observe::tracing_setup::{init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,switchboard_core=debug,switchboard_infra=debug",
        _ => "trace",
    };
    init_tracing(filter, cli.otel).map_err(|e| anyhow::anyhow!("failed to set up tracing: {e}"))?;

    // Shell completions don't need configuration
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "swb", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let result = match cli.command {
        Commands::Config { command } => {
            cli::config::handle_config_command(command, &config_path, cli.json).await
        }
        Commands::Breaker { state_db, command } => {
            cli::breaker::handle_breaker_command(command, &config_path, state_db, cli.json).await
        }
        Commands::Simulate(args) => cli::simulate::run(args, &config_path, cli.json).await,
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    shutdown_tracing();
    result
}
