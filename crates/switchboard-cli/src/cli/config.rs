//! Configuration CLI commands: show, check, path.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;

use switchboard_infra::config::{load_config, load_config_strict};
use switchboard_infra::provider::simulated_adapters;
use switchboard_types::config::{AdmissionProfile, SwitchboardConfig};

/// Providers with built-in admission profiles.
const BUILTIN_PROVIDERS: [&str; 5] = ["openai", "anthropic", "gemini", "groq", "mistral"];

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration and admission profiles.
    Show,

    /// Validate the configuration file, including simulated provider scripts.
    Check,

    /// Print the configuration file path in use.
    Path,
}

pub async fn handle_config_command(cmd: ConfigCommand, path: &Path, json: bool) -> Result<()> {
    match cmd {
        ConfigCommand::Show => config_show(path, json).await,
        ConfigCommand::Check => config_check(path, json).await,
        ConfigCommand::Path => {
            if json {
                println!("{}", serde_json::json!({ "path": path.display().to_string() }));
            } else {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct ProfileRow {
    provider: String,
    source: &'static str,
    #[serde(flatten)]
    profile: AdmissionProfile,
}

/// Effective admission profile for every provider the config mentions.
fn profile_rows(config: &SwitchboardConfig) -> Vec<ProfileRow> {
    let mut names: Vec<String> = BUILTIN_PROVIDERS.iter().map(|s| s.to_string()).collect();
    names.extend(config.admission.providers.keys().cloned());
    names.extend(config.simulated.iter().map(|s| s.name.clone()));
    names.sort();
    names.dedup();

    names
        .into_iter()
        .map(|name| {
            let source = if config.admission.providers.contains_key(&name) {
                "override"
            } else if AdmissionProfile::builtin(&name).is_some() {
                "builtin"
            } else {
                "default"
            };
            ProfileRow {
                profile: config.admission.profile_for(&name),
                provider: name,
                source,
            }
        })
        .collect()
}

async fn config_show(path: &Path, json: bool) -> Result<()> {
    let config = load_config(path).await;

    if json {
        let out = serde_json::json!({
            "path": path.display().to_string(),
            "config": config,
            "admission_profiles": profile_rows(&config),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Configuration").bold(),
        style(path.display()).dim()
    );
    println!();
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    for line in rendered.lines() {
        println!("  {line}");
    }
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Provider").fg(Color::White),
        Cell::new("Source").fg(Color::White),
        Cell::new("Reservoir").fg(Color::White),
        Cell::new("Refill").fg(Color::White),
        Cell::new("Concurrent").fg(Color::White),
        Cell::new("Spacing").fg(Color::White),
        Cell::new("Queue").fg(Color::White),
    ]);
    for row in profile_rows(&config) {
        let p = &row.profile;
        table.add_row(vec![
            Cell::new(&row.provider).fg(Color::Cyan),
            Cell::new(row.source).fg(Color::DarkGrey),
            Cell::new(p.reservoir),
            Cell::new(format!("{} / {}ms", p.refill_amount, p.refill_interval_ms)),
            Cell::new(p.max_concurrent),
            Cell::new(format!("{}ms", p.min_spacing_ms)),
            Cell::new(p.high_water),
        ]);
    }
    println!("  {}", style("Admission profiles").bold());
    println!("{table}");
    println!();

    Ok(())
}

async fn config_check(path: &Path, json: bool) -> Result<()> {
    let config = load_config_strict(path)
        .await
        .with_context(|| format!("configuration at {} is not usable", path.display()))?;
    let adapters = simulated_adapters(&config.simulated).context("invalid simulated provider")?;

    if json {
        let out = serde_json::json!({
            "path": path.display().to_string(),
            "valid": true,
            "simulated_providers": adapters.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {} is valid",
            style("✓").green().bold(),
            style(path.display()).cyan()
        );
        println!(
            "  {}",
            style(format!(
                "{} simulated provider(s), breaker threshold {}, default timeout {}",
                adapters.len(),
                config.breaker.failure_threshold,
                if config.dispatch.unbounded {
                    "unbounded".to_string()
                } else {
                    format!("{}ms", config.dispatch.default_timeout_ms)
                }
            ))
            .dim()
        );
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_rows_sources() {
        let mut config = SwitchboardConfig::default();
        config.admission.providers.insert(
            "openai".into(),
            AdmissionProfile {
                max_concurrent: 1,
                ..AdmissionProfile::default()
            },
        );
        config.simulated.push(
            toml::from_str("name = \"local\"").unwrap(),
        );

        let rows = profile_rows(&config);
        let find = |n: &str| rows.iter().find(|r| r.provider == n).unwrap();
        assert_eq!(find("openai").source, "override");
        assert_eq!(find("openai").profile.max_concurrent, 1);
        assert_eq!(find("groq").source, "builtin");
        assert_eq!(find("local").source, "default");
        assert_eq!(rows.len(), 6);
    }
}
