//! `swb simulate`: drive the provider chain with scripted providers.
//!
//! Providers come from `--provider` flags, then the `[[simulated]]` entries in
//! the configuration, then a built-in demo trio. Requests run concurrently
//! and the report shows who served each one plus the resulting breaker and
//! admission state.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::Instrument;

use switchboard_core::dispatch::admission::AdmissionSnapshot;
use switchboard_core::dispatch::chain::{DispatchOptions, ProviderChain};
use switchboard_core::dispatch::store::BoxBreakerStore;
use switchboard_infra::config::load_config;
use switchboard_infra::provider::simulated::parse_script;
use switchboard_infra::provider::simulated_adapters;
use switchboard_observe::attrs;
use switchboard_types::config::SimulatedProviderConfig;
use switchboard_types::error::ChainErrorCode;
use switchboard_types::llm::{Message, StreamChunk};

use super::breaker::{BreakerStatusRow, open_store, status_rows, status_table};
use super::truncate;

#[derive(Args)]
pub struct SimulateArgs {
    /// Number of requests to dispatch.
    #[arg(long, short = 'n', default_value_t = 20)]
    pub requests: usize,

    /// Requests in flight at once.
    #[arg(long, short = 'c', default_value_t = 4)]
    pub concurrency: usize,

    /// Use streaming dispatch.
    #[arg(long)]
    pub stream: bool,

    /// Persist breaker state to this SQLite URL instead of memory.
    #[arg(long, env = "SWITCHBOARD_STATE_DB", value_name = "URL")]
    pub state_db: Option<String>,

    /// Per-request deadline in milliseconds (defaults to the configured one).
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Scripted provider as `name=step,step,...`; repeat for fallback order.
    #[arg(long = "provider", short = 'p', value_name = "NAME=STEPS", value_parser = parse_provider_arg)]
    pub providers: Vec<SimulatedProviderConfig>,

    /// Latency applied to providers given with `--provider`.
    #[arg(long, default_value_t = 50, value_name = "MS")]
    pub latency_ms: u64,
}

/// Parse `name=step,step` into a provider config, validating the script.
fn parse_provider_arg(s: &str) -> Result<SimulatedProviderConfig, String> {
    let (name, script) = match s.split_once('=') {
        Some((name, script)) => (name.trim(), script.trim()),
        None => (s.trim(), ""),
    };
    if name.is_empty() {
        return Err("provider name is empty".to_string());
    }
    let script: Vec<String> = script
        .split(',')
        .map(str::trim)
        .filter(|step| !step.is_empty())
        .map(String::from)
        .collect();
    parse_script(&script).map_err(|e| e.to_string())?;
    Ok(SimulatedProviderConfig {
        name: name.to_string(),
        model: "sim-1".to_string(),
        latency_ms: 0,
        script,
        available: true,
    })
}

fn demo_providers() -> Vec<SimulatedProviderConfig> {
    let provider = |name: &str, latency_ms: u64, script: &[&str]| SimulatedProviderConfig {
        name: name.to_string(),
        model: "sim-1".to_string(),
        latency_ms,
        script: script.iter().map(|s| s.to_string()).collect(),
        available: true,
    };
    vec![
        provider("primary", 80, &["ok", "status:503", "status:503", "status:429:retry_after=1", "ok"]),
        provider("secondary", 120, &["ok", "network", "ok"]),
        provider("tertiary", 200, &["ok"]),
    ]
}

/// Outcome of one simulated request.
#[derive(Debug, Serialize)]
struct RequestOutcome {
    index: usize,
    provider: Option<String>,
    code: Option<ChainErrorCode>,
    fallback_used: bool,
    /// Providers tried; unknown for streams.
    attempts: Option<usize>,
    elapsed_ms: u64,
    detail: String,
}

impl RequestOutcome {
    fn ok(&self) -> bool {
        self.code.is_none()
    }
}

#[derive(Serialize)]
struct SimulationReport<'a> {
    mode: &'static str,
    requests: usize,
    succeeded: usize,
    failed: usize,
    outcomes: &'a [RequestOutcome],
    breakers: Vec<BreakerStatusRow>,
    admission: Vec<AdmissionSnapshot>,
}

pub async fn run(args: SimulateArgs, config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path).await;

    let providers = if !args.providers.is_empty() {
        args.providers
            .iter()
            .cloned()
            .map(|mut p| {
                p.latency_ms = args.latency_ms;
                p
            })
            .collect()
    } else if !config.simulated.is_empty() {
        config.simulated.clone()
    } else {
        demo_providers()
    };
    let adapters = simulated_adapters(&providers).context("invalid simulated provider")?;

    let chain = match &args.state_db {
        Some(url) => {
            let store = open_store(url).await?;
            ProviderChain::new(&config, adapters, BoxBreakerStore::new(store))
        }
        None => ProviderChain::in_memory(&config, adapters),
    };

    let mode = if args.stream {
        attrs::MODE_STREAM
    } else {
        attrs::MODE_BUFFERED
    };
    let span = tracing::info_span!(
        attrs::SPAN_SIMULATE,
        requests = args.requests,
        concurrency = args.concurrency,
        mode,
        providers = chain.providers().len(),
    );

    let timeout = args.timeout_ms.map(Duration::from_millis);
    let stream = args.stream;
    let mut outcomes: Vec<RequestOutcome> = futures_util::stream::iter(0..args.requests)
        .map(|index| {
            let chain = chain.clone();
            async move {
                let mut opts = DispatchOptions::default().operation(attrs::OP_SIMULATE);
                if let Some(timeout) = timeout {
                    opts = opts.timeout(timeout);
                }
                let messages = vec![Message::user(format!("simulated request #{index}"))];
                if stream {
                    run_stream(&chain, index, messages, opts).await
                } else {
                    run_buffered(&chain, index, messages, opts).await
                }
            }
        })
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .instrument(span)
        .await;
    outcomes.sort_by_key(|o| o.index);

    let breakers = status_rows(chain.breaker()).await?;
    let admission = chain.admission().snapshots();
    let succeeded = outcomes.iter().filter(|o| o.ok()).count();

    if json {
        let report = SimulationReport {
            mode,
            requests: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
            outcomes: &outcomes,
            breakers,
            admission,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} requests, {} concurrent, {} mode",
        style("Simulation").bold(),
        style(outcomes.len()).bold(),
        args.concurrency.max(1),
        style(mode).cyan()
    );
    println!();
    println!("{}", outcome_table(&outcomes));
    println!();
    print_served_by(&chain, &outcomes);
    println!();
    println!("  {}", style("Circuit Breakers").bold());
    if breakers.is_empty() {
        println!("  {}", style("no breaker state recorded").dim());
    } else {
        println!("{}", status_table(&breakers));
    }
    println!();
    println!("  {}", style("Admission").bold());
    println!("{}", admission_table(&admission));
    println!();

    Ok(())
}

async fn run_buffered(
    chain: &ProviderChain,
    index: usize,
    messages: Vec<Message>,
    opts: DispatchOptions,
) -> RequestOutcome {
    match chain.dispatch(messages, opts).await {
        Ok(result) => RequestOutcome {
            index,
            detail: truncate(&result.response.content, 40),
            provider: Some(result.provider),
            code: None,
            fallback_used: result.fallback_used,
            attempts: Some(result.attempts.len()),
            elapsed_ms: result.elapsed.as_millis() as u64,
        },
        Err(e) => RequestOutcome {
            index,
            provider: None,
            code: Some(e.code),
            fallback_used: false,
            attempts: Some(e.attempts.len()),
            elapsed_ms: e.elapsed.as_millis() as u64,
            detail: e.message,
        },
    }
}

async fn run_stream(
    chain: &ProviderChain,
    index: usize,
    messages: Vec<Message>,
    opts: DispatchOptions,
) -> RequestOutcome {
    let started = Instant::now();
    let mut stream = chain.dispatch_stream(messages, opts);
    let mut outcome = RequestOutcome {
        index,
        provider: None,
        code: None,
        fallback_used: false,
        attempts: None,
        elapsed_ms: 0,
        detail: String::new(),
    };
    let mut deltas = 0usize;
    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Meta { provider, .. } => {
                outcome.fallback_used = chain.providers().first() != Some(&provider.as_str());
                outcome.provider = Some(provider);
            }
            StreamChunk::Delta { .. } => deltas += 1,
            StreamChunk::Final { content, .. } => {
                outcome.detail = format!("{deltas} deltas: {}", truncate(&content, 30));
            }
            StreamChunk::Error { message, code, .. } => {
                outcome.code = Some(code);
                outcome.detail = format!("after {deltas} deltas: {message}");
            }
        }
    }
    outcome.elapsed_ms = started.elapsed().as_millis() as u64;
    outcome
}

fn outcome_table(outcomes: &[RequestOutcome]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("#").fg(Color::White),
        Cell::new("Outcome").fg(Color::White),
        Cell::new("Provider").fg(Color::White),
        Cell::new("Tried").fg(Color::White),
        Cell::new("Elapsed").fg(Color::White),
        Cell::new("Detail").fg(Color::White),
    ]);
    for o in outcomes {
        let outcome = match o.code {
            None if o.fallback_used => Cell::new("fallback").fg(Color::Yellow),
            None => Cell::new("ok").fg(Color::Green),
            Some(code) => Cell::new(code.to_string()).fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(o.index),
            outcome,
            Cell::new(o.provider.as_deref().unwrap_or("-")).fg(Color::Cyan),
            Cell::new(o.attempts.map(|n| n.to_string()).unwrap_or_else(|| "-".into())),
            Cell::new(format!("{}ms", o.elapsed_ms)),
            Cell::new(truncate(&o.detail, 48)).fg(Color::DarkGrey),
        ]);
    }
    table
}

fn print_served_by(chain: &ProviderChain, outcomes: &[RequestOutcome]) {
    let failed = outcomes.iter().filter(|o| !o.ok()).count();
    let parts: Vec<String> = chain
        .providers()
        .into_iter()
        .map(|name| {
            let served = outcomes
                .iter()
                .filter(|o| o.ok() && o.provider.as_deref() == Some(name))
                .count();
            format!("{} {}", style(name).cyan(), served)
        })
        .collect();
    println!("  Served by: {}", parts.join(", "));
    if failed > 0 {
        println!(
            "  {} {} request{} failed",
            style("!").red().bold(),
            failed,
            if failed == 1 { "" } else { "s" }
        );
    } else {
        println!("  {} all requests served", style("✓").green().bold());
    }
}

fn admission_table(snapshots: &[AdmissionSnapshot]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Provider").fg(Color::White),
        Cell::new("Tokens").fg(Color::White),
        Cell::new("In flight").fg(Color::White),
        Cell::new("Admitted").fg(Color::White),
        Cell::new("Rejected").fg(Color::White),
        Cell::new("Timed out").fg(Color::White),
        Cell::new("Paused").fg(Color::White),
    ]);
    for s in snapshots {
        let paused = s
            .paused_for_ms
            .map(|ms| Cell::new(format!("{ms}ms")).fg(Color::Yellow))
            .unwrap_or_else(|| Cell::new("-").fg(Color::DarkGrey));
        table.add_row(vec![
            Cell::new(&s.provider).fg(Color::Cyan),
            Cell::new(format!("{}/{}", s.tokens, s.reservoir)),
            Cell::new(format!("{}/{}", s.in_flight, s.max_concurrent)),
            Cell::new(s.admitted),
            Cell::new(s.rejected),
            Cell::new(s.timed_out),
            paused,
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_arg() {
        let p = parse_provider_arg("openai=status:503, ok").unwrap();
        assert_eq!(p.name, "openai");
        assert_eq!(p.script, vec!["status:503", "ok"]);

        let bare = parse_provider_arg("local").unwrap();
        assert!(bare.script.is_empty());
    }

    #[test]
    fn test_parse_provider_arg_rejects_bad_input() {
        assert!(parse_provider_arg("=ok").is_err());
        let err = parse_provider_arg("openai=explode").unwrap_err();
        assert!(err.contains("explode"));
    }

    #[test]
    fn test_demo_providers_have_valid_scripts() {
        assert!(simulated_adapters(&demo_providers()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_and_stream_outcomes() {
        let providers = vec![
            parse_provider_arg("primary=status:503").unwrap(),
            parse_provider_arg("backup=ok").unwrap(),
        ];
        let mut config = switchboard_types::config::SwitchboardConfig::default();
        config.dispatch.max_retries = 0;
        let chain = ProviderChain::in_memory(&config, simulated_adapters(&providers).unwrap());

        let buffered = run_buffered(&chain, 0, vec![Message::user("hi")], DispatchOptions::default()).await;
        assert!(buffered.ok());
        assert_eq!(buffered.provider.as_deref(), Some("backup"));
        assert!(buffered.fallback_used);
        assert_eq!(buffered.attempts, Some(2));

        let streamed = run_stream(&chain, 1, vec![Message::user("hi")], DispatchOptions::default()).await;
        assert!(streamed.ok());
        assert_eq!(streamed.provider.as_deref(), Some("backup"));
        assert!(streamed.fallback_used);
    }

    #[test]
    fn test_simulate_args_parse() {
        use clap::Parser;
        let cli = crate::cli::Cli::try_parse_from([
            "swb", "simulate", "-n", "5", "--stream", "-p", "a=ok", "-p", "b=network,ok",
        ])
        .unwrap();
        let crate::cli::Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.requests, 5);
        assert!(args.stream);
        assert_eq!(args.providers.len(), 2);
        assert_eq!(args.providers[1].name, "b");
    }
}
