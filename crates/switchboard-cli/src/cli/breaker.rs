//! Breaker CLI commands: status, reset.
//!
//! Reads and writes the shared SQLite breaker store, so the output reflects
//! every process that dispatches through the same database.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;

use switchboard_core::dispatch::breaker::CircuitBreaker;
use switchboard_core::dispatch::store::BoxBreakerStore;
use switchboard_infra::config::load_config;
use switchboard_infra::sqlite::breaker_store::SqliteBreakerStore;
use switchboard_infra::sqlite::pool::default_database_url;
use switchboard_types::breaker::{BreakerState, CircuitState};

use super::truncate;

#[derive(Subcommand)]
pub enum BreakerCommand {
    /// Show circuit state for every provider in the store.
    Status,

    /// Close a provider's circuit and clear its counters.
    Reset {
        /// Provider name to reset.
        provider: Option<String>,

        /// Reset every provider.
        #[arg(long, conflicts_with = "provider")]
        all: bool,
    },
}

pub async fn handle_breaker_command(
    cmd: BreakerCommand,
    config_path: &Path,
    state_db: Option<String>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path).await;
    let url = state_db.unwrap_or_else(default_database_url);
    let store = open_store(&url).await?;
    let breaker = CircuitBreaker::new(config.breaker.clone(), BoxBreakerStore::new(store));

    match cmd {
        BreakerCommand::Status => breaker_status(&breaker, json).await,
        BreakerCommand::Reset { provider, all } => {
            breaker_reset(&breaker, provider.as_deref(), all, json).await
        }
    }
}

/// Open the SQLite breaker store at `url`, creating its directory first.
pub(super) async fn open_store(url: &str) -> Result<SqliteBreakerStore> {
    if let Some(dir) = sqlite_parent_dir(url) {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    SqliteBreakerStore::open(url)
        .await
        .with_context(|| format!("failed to open breaker store at {url}"))
}

/// Directory holding a `sqlite://` file, if the URL names one.
fn sqlite_parent_dir(url: &str) -> Option<std::path::PathBuf> {
    let path = url.strip_prefix("sqlite://")?;
    let path = path.split('?').next()?;
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

#[derive(Debug, Serialize)]
pub struct BreakerStatusRow {
    pub provider: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub opened_at: Option<DateTime<Utc>>,
    /// Milliseconds until an open circuit admits a probe.
    pub cooldown_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl BreakerStatusRow {
    pub fn new(provider: String, state: CircuitState, open_duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            cooldown_ms: cooldown_remaining(&state, open_duration, now).map(|d| d.as_millis() as u64),
            provider,
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_failures: state.total_failures,
            opened_at: state.opened_at,
            last_error: state.last_error,
        }
    }
}

/// Remaining cooldown for an open circuit; `None` when not open.
fn cooldown_remaining(state: &CircuitState, open_duration: Duration, now: DateTime<Utc>) -> Option<Duration> {
    if state.state != BreakerState::Open {
        return None;
    }
    let opened = state.opened_at?;
    let elapsed = (now - opened).to_std().unwrap_or(Duration::ZERO);
    Some(open_duration.saturating_sub(elapsed))
}

pub fn state_cell(state: BreakerState) -> Cell {
    match state {
        BreakerState::Closed => Cell::new("closed").fg(Color::Green),
        BreakerState::Open => Cell::new("OPEN").fg(Color::Red),
        BreakerState::HalfOpen => Cell::new("half_open").fg(Color::Yellow),
    }
}

pub fn status_table(rows: &[BreakerStatusRow]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Provider").fg(Color::White),
        Cell::new("Circuit").fg(Color::White),
        Cell::new("Failures").fg(Color::White),
        Cell::new("Total").fg(Color::White),
        Cell::new("Cooldown").fg(Color::White),
        Cell::new("Last Error").fg(Color::White),
    ]);
    for row in rows {
        let cooldown = row
            .cooldown_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&row.provider).fg(Color::Cyan),
            state_cell(row.state),
            Cell::new(row.consecutive_failures),
            Cell::new(row.total_failures),
            Cell::new(cooldown).fg(Color::DarkGrey),
            Cell::new(truncate(row.last_error.as_deref().unwrap_or("-"), 40)).fg(Color::DarkGrey),
        ]);
    }
    table
}

pub async fn status_rows(breaker: &CircuitBreaker) -> Result<Vec<BreakerStatusRow>> {
    let open_duration = breaker.config().open_duration();
    let now = Utc::now();
    let states = breaker.states().await.context("failed to read breaker state")?;
    Ok(states
        .into_iter()
        .map(|(name, state)| BreakerStatusRow::new(name, state, open_duration, now))
        .collect())
}

async fn breaker_status(breaker: &CircuitBreaker, json: bool) -> Result<()> {
    let rows = status_rows(breaker).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!();
        println!(
            "  {} No breaker state recorded yet. Run {} to generate some.",
            style("i").blue().bold(),
            style("swb simulate --state-db <URL>").cyan()
        );
        println!();
        return Ok(());
    }

    println!();
    println!("  {}", style("Circuit Breakers").bold());
    println!();
    println!("{}", status_table(&rows));
    let open = rows.iter().filter(|r| r.state != BreakerState::Closed).count();
    println!();
    println!(
        "  {} provider{}, {} not closed",
        style(rows.len()).bold(),
        if rows.len() == 1 { "" } else { "s" },
        style(open).bold()
    );
    println!();
    Ok(())
}

async fn breaker_reset(
    breaker: &CircuitBreaker,
    provider: Option<&str>,
    all: bool,
    json: bool,
) -> Result<()> {
    let reset: Vec<String> = match (provider, all) {
        (_, true) => {
            let names = breaker
                .states()
                .await
                .context("failed to read breaker state")?
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            breaker.reset_all().await.context("failed to reset breakers")?;
            names
        }
        (Some(name), false) => {
            breaker
                .reset(name)
                .await
                .with_context(|| format!("failed to reset breaker for '{name}'"))?;
            vec![name.to_string()]
        }
        (None, false) => anyhow::bail!("name a provider to reset, or pass --all"),
    };

    if json {
        println!("{}", serde_json::json!({ "reset": reset }));
    } else {
        println!();
        for name in &reset {
            println!(
                "  {} Circuit for {} closed",
                style("✓").green().bold(),
                style(name).cyan()
            );
        }
        if reset.is_empty() {
            println!("  {} Nothing to reset", style("i").blue().bold());
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_since(secs_ago: i64) -> CircuitState {
        CircuitState {
            state: BreakerState::Open,
            consecutive_failures: 5,
            opened_at: Some(Utc::now() - chrono::Duration::seconds(secs_ago)),
            ..CircuitState::default()
        }
    }

    #[test]
    fn test_cooldown_remaining_for_open_circuit() {
        let now = Utc::now();
        let left = cooldown_remaining(&open_since(10), Duration::from_secs(30), now).unwrap();
        assert!(left <= Duration::from_secs(20));
        assert!(left > Duration::from_secs(19));
    }

    #[test]
    fn test_cooldown_elapsed_is_zero() {
        let left = cooldown_remaining(&open_since(60), Duration::from_secs(30), Utc::now());
        assert_eq!(left, Some(Duration::ZERO));
    }

    #[test]
    fn test_no_cooldown_when_closed() {
        let left = cooldown_remaining(&CircuitState::closed(), Duration::from_secs(30), Utc::now());
        assert!(left.is_none());
    }

    #[test]
    fn test_sqlite_parent_dir() {
        assert_eq!(
            sqlite_parent_dir("sqlite:///tmp/swb/breakers.db?mode=rwc"),
            Some(std::path::PathBuf::from("/tmp/swb"))
        );
        assert_eq!(sqlite_parent_dir("sqlite://breakers.db"), None);
        assert_eq!(sqlite_parent_dir("sqlite://:memory:"), None);
    }

    #[tokio::test]
    async fn test_status_rows_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("b.db").display());
        let store = SqliteBreakerStore::open(&url).await.unwrap();
        let breaker = CircuitBreaker::new(
            switchboard_types::config::BreakerConfig::default(),
            BoxBreakerStore::new(store),
        );
        breaker.record_failure("openai", "HTTP 503").await;

        let rows = status_rows(&breaker).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].provider, "openai");
        assert_eq!(rows[0].consecutive_failures, 1);
        assert!(rows[0].cooldown_ms.is_none());
    }
}
