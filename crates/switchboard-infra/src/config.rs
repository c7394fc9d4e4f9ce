//! Configuration loader for Switchboard.
//!
//! Reads `switchboard.toml` and deserializes it into [`SwitchboardConfig`].
//! The lenient loader falls back to defaults when the file is missing or
//! malformed; the strict loader reports why.

use std::path::{Path, PathBuf};

use thiserror::Error;

use switchboard_types::config::{ConfigError, SwitchboardConfig};

/// File name looked up in the data directory.
pub const CONFIG_FILE_NAME: &str = "switchboard.toml";

/// Why a configuration file could not be used.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Data directory from `SWITCHBOARD_DATA_DIR`, falling back to
/// `~/.switchboard`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("SWITCHBOARD_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".switchboard")
        }
    }
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join(CONFIG_FILE_NAME)
}

/// Load configuration from `path`.
///
/// - If the file does not exist, returns [`SwitchboardConfig::default()`].
/// - If the file cannot be read, parsed or validated, logs a warning and
///   returns the default.
pub async fn load_config(path: &Path) -> SwitchboardConfig {
    match load_config_strict(path).await {
        Ok(config) => config,
        Err(ConfigLoadError::Read { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            tracing::debug!("No config found at {}, using defaults", path.display());
            SwitchboardConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            SwitchboardConfig::default()
        }
    }
}

/// Load and validate configuration, reporting every failure.
pub async fn load_config_strict(path: &Path) -> Result<SwitchboardConfig, ConfigLoadError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let config = parse_config(&content).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<SwitchboardConfig, toml::de::Error> {
    toml::from_str(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join(CONFIG_FILE_NAME)).await;
        assert_eq!(config.dispatch.default_timeout_ms, 60_000);
        assert!(config.simulated.is_empty());
    }

    #[tokio::test]
    async fn load_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"
[dispatch]
default_timeout_ms = 15000
max_retries = 2

[breaker]
failure_threshold = 3

[admission.providers.openai]
reservoir = 10
refill_amount = 10
refill_interval_ms = 1000
max_concurrent = 2
min_spacing_ms = 0
high_water = 4

[[simulated]]
name = "flaky"
script = ["status:503", "ok"]
"#,
        )
        .await
        .unwrap();

        let config = load_config(&path).await;
        assert_eq!(config.dispatch.default_timeout_ms, 15_000);
        assert_eq!(config.dispatch.max_retries, 2);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.admission.profile_for("openai").max_concurrent, 2);
        assert_eq!(config.simulated[0].script.len(), 2);
    }

    #[tokio::test]
    async fn load_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_config(&path).await;
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[tokio::test]
    async fn load_config_strict_reports_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "[dispatch]\nmax_retries = \"many\"")
            .await
            .unwrap();

        let err = load_config_strict(&path).await.unwrap_err();
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }

    #[tokio::test]
    async fn load_config_strict_reports_validation_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "[breaker]\nfailure_threshold = 0")
            .await
            .unwrap();

        let err = load_config_strict(&path).await.unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid(_)));
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[tokio::test]
    async fn load_config_strict_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = load_config_strict(&tmp.path().join("nope.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Read { .. }));
    }
}
