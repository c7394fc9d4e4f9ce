//! Configuration types for the dispatcher.
//!
//! `SwitchboardConfig` mirrors `switchboard.toml`. Every field has a default so
//! an empty file (or no file at all) yields a working configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Top-level dispatcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Scripted providers for `swb simulate`.
    #[serde(default)]
    pub simulated: Vec<SimulatedProviderConfig>,
}

impl SwitchboardConfig {
    /// Reject values that would make the dispatcher misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dispatch;
        if !d.unbounded && d.default_timeout_ms == 0 {
            return Err(invalid(
                "dispatch.default_timeout_ms",
                "must be > 0 (set dispatch.unbounded = true for no deadline)",
            ));
        }
        if d.backoff.max_delay_ms < d.backoff.base_delay_ms {
            return Err(invalid("dispatch.backoff.max_delay_ms", "must be >= base_delay_ms"));
        }
        if !(0.0..=1.0).contains(&d.backoff.jitter_ratio) {
            return Err(invalid("dispatch.backoff.jitter_ratio", "must be within [0, 1]"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be >= 1"));
        }
        if self.breaker.half_open_max_attempts == 0 {
            return Err(invalid("breaker.half_open_max_attempts", "must be >= 1"));
        }
        self.admission.default.validate("admission.default")?;
        for (name, profile) in &self.admission.providers {
            profile.validate(&format!("admission.providers.{name}"))?;
        }
        Ok(())
    }
}

/// Chain-level timing and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Overall deadline per dispatch call.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Ignore `default_timeout_ms` and run without a deadline.
    #[serde(default)]
    pub unbounded: bool,

    /// Smallest per-attempt window; below this the chain stops trying.
    #[serde(default = "default_min_attempt_ms")]
    pub min_attempt_ms: u64,

    /// Same-provider retries before falling back.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long a request may wait in an admission queue.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_min_attempt_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    1
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            unbounded: false,
            min_attempt_ms: default_min_attempt_ms(),
            max_retries: default_max_retries(),
            queue_timeout_ms: default_queue_timeout_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn min_attempt(&self) -> Duration {
        Duration::from_millis(self.min_attempt_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Exponential backoff between same-provider retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the computed delay added as random jitter.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Circuit breaker thresholds, shared by every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive eligible failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit rejects requests before probing.
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,

    /// Concurrent probes allowed while half-open.
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_half_open_max_attempts() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_max_attempts: default_half_open_max_attempts(),
        }
    }
}

impl BreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

/// Token-bucket, concurrency and queue limits for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionProfile {
    /// Bucket capacity; the reservoir starts full.
    pub reservoir: u32,
    /// Tokens added per refill tick.
    pub refill_amount: u32,
    pub refill_interval_ms: u64,
    pub max_concurrent: u32,
    /// Minimum gap between two admissions.
    pub min_spacing_ms: u64,
    /// Queue depth at which new waiters are rejected.
    pub high_water: u32,
}

impl Default for AdmissionProfile {
    fn default() -> Self {
        Self {
            reservoir: 60,
            refill_amount: 60,
            refill_interval_ms: 60_000,
            max_concurrent: 10,
            min_spacing_ms: 100,
            high_water: 100,
        }
    }
}

impl AdmissionProfile {
    /// Shipped profile for well-known provider names.
    pub fn builtin(name: &str) -> Option<Self> {
        let profile = match name {
            "openai" => Self {
                reservoir: 500,
                refill_amount: 500,
                refill_interval_ms: 60_000,
                max_concurrent: 20,
                min_spacing_ms: 20,
                high_water: 200,
            },
            "anthropic" => Self {
                reservoir: 50,
                refill_amount: 50,
                refill_interval_ms: 60_000,
                max_concurrent: 5,
                min_spacing_ms: 200,
                high_water: 50,
            },
            "gemini" => Self {
                reservoir: 60,
                refill_amount: 60,
                refill_interval_ms: 60_000,
                max_concurrent: 10,
                min_spacing_ms: 100,
                high_water: 100,
            },
            "groq" => Self {
                reservoir: 30,
                refill_amount: 30,
                refill_interval_ms: 60_000,
                max_concurrent: 5,
                min_spacing_ms: 250,
                high_water: 30,
            },
            "mistral" => Self {
                reservoir: 60,
                refill_amount: 60,
                refill_interval_ms: 60_000,
                max_concurrent: 5,
                min_spacing_ms: 150,
                high_water: 50,
            },
            _ => return None,
        };
        Some(profile)
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.reservoir == 0 {
            return Err(invalid(&format!("{field}.reservoir"), "must be >= 1"));
        }
        if self.refill_interval_ms == 0 {
            return Err(invalid(&format!("{field}.refill_interval_ms"), "must be > 0"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid(&format!("{field}.max_concurrent"), "must be >= 1"));
        }
        Ok(())
    }
}

/// Admission profiles: a fallback default plus per-provider overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub default: AdmissionProfile,

    #[serde(default)]
    pub providers: HashMap<String, AdmissionProfile>,
}

impl AdmissionConfig {
    /// Resolve a provider's profile: override, then built-in, then default.
    pub fn profile_for(&self, name: &str) -> AdmissionProfile {
        self.providers
            .get(name)
            .cloned()
            .or_else(|| AdmissionProfile::builtin(name))
            .unwrap_or_else(|| self.default.clone())
    }
}

/// A scripted provider for the `swb simulate` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedProviderConfig {
    pub name: String,

    #[serde(default = "default_simulated_model")]
    pub model: String,

    /// Latency of every call, in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,

    /// Outcome script replayed in order and then repeated from the start, e.g.
    /// `["status:429:retry_after=1", "ok"]`. Empty means always succeed.
    #[serde(default)]
    pub script: Vec<String>,

    /// Whether the adapter reports credentials as configured.
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_simulated_model() -> String {
    "sim-1".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SwitchboardConfig::default();
        assert_eq!(config.dispatch.default_timeout_ms, 60_000);
        assert!(!config.dispatch.unbounded);
        assert_eq!(config.dispatch.max_retries, 1);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.half_open_max_attempts, 1);
        assert!(config.simulated.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: SwitchboardConfig = toml::from_str("").unwrap();
        assert_eq!(config.dispatch.min_attempt_ms, 500);
        assert_eq!(config.dispatch.backoff.base_delay_ms, 500);
        assert_eq!(config.breaker.open_duration_ms, 30_000);
    }

    #[test]
    fn test_toml_with_overrides() {
        let toml_str = r#"
[dispatch]
default_timeout_ms = 20000
max_retries = 3

[dispatch.backoff]
base_delay_ms = 100

[breaker]
failure_threshold = 2

[admission.providers.openai]
reservoir = 10
refill_amount = 5
refill_interval_ms = 1000
max_concurrent = 2
min_spacing_ms = 0
high_water = 4

[[simulated]]
name = "flaky"
latency_ms = 50
script = ["status:503", "ok"]
"#;
        let config: SwitchboardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dispatch.default_timeout_ms, 20_000);
        assert_eq!(config.dispatch.max_retries, 3);
        assert_eq!(config.dispatch.backoff.base_delay_ms, 100);
        assert_eq!(config.dispatch.backoff.max_delay_ms, 8_000);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.admission.profile_for("openai").reservoir, 10);
        assert_eq!(config.simulated[0].name, "flaky");
        assert_eq!(config.simulated[0].model, "sim-1");
        assert!(config.simulated[0].available);
    }

    #[test]
    fn test_profile_lookup_order() {
        let mut admission = AdmissionConfig::default();
        assert_eq!(
            admission.profile_for("anthropic"),
            AdmissionProfile::builtin("anthropic").unwrap()
        );
        assert_eq!(admission.profile_for("acme"), AdmissionProfile::default());

        let custom = AdmissionProfile {
            reservoir: 1,
            ..AdmissionProfile::default()
        };
        admission.providers.insert("anthropic".into(), custom.clone());
        assert_eq!(admission.profile_for("anthropic"), custom);
    }

    #[test]
    fn test_builtin_profiles_differ() {
        let openai = AdmissionProfile::builtin("openai").unwrap();
        let anthropic = AdmissionProfile::builtin("anthropic").unwrap();
        assert_ne!(openai.max_concurrent, anthropic.max_concurrent);
        assert_ne!(openai.min_spacing_ms, anthropic.min_spacing_ms);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SwitchboardConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = SwitchboardConfig::default();
        config.dispatch.backoff.jitter_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = SwitchboardConfig::default();
        config.admission.providers.insert(
            "x".into(),
            AdmissionProfile {
                max_concurrent: 0,
                ..AdmissionProfile::default()
            },
        );
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("admission.providers.x.max_concurrent"));
    }

    #[test]
    fn test_unbounded_allows_zero_timeout() {
        let mut config = SwitchboardConfig::default();
        config.dispatch.default_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.dispatch.unbounded = true;
        assert!(config.validate().is_ok());
    }
}
