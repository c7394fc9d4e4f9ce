//! CLI command definitions for the `swb` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! noun (`swb config check`, `swb breaker status`).

pub mod breaker;
pub mod config;
pub mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use self::breaker::BreakerCommand;
use self::config::ConfigCommand;
use self::simulate::SimulateArgs;

/// Inspect and exercise the multi-provider dispatcher.
#[derive(Parser)]
#[command(name = "swb", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (defaults to ~/.switchboard/switchboard.toml).
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Also export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show or validate configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Inspect or reset persisted circuit breaker state.
    Breaker {
        /// Breaker database URL (defaults to ~/.switchboard/breakers.db).
        #[arg(long, global = true, env = "SWITCHBOARD_STATE_DB", value_name = "URL")]
        state_db: Option<String>,

        #[command(subcommand)]
        command: BreakerCommand,
    },

    /// Run a dispatch workload against scripted providers.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Shorten `s` to at most `max` characters for table cells.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a rather long error message", 10), "a rathe...");
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["swb", "breaker", "status", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Breaker { .. }));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }
}
