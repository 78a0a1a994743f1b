//! Application configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty or missing file
//! is a valid configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub reconciler: ReconcilerConfig,
    pub poller: PollerConfig,
    pub ui: UiConfig,
}

/// Sound-server command settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Executable used to talk to the sound server
    pub program: String,
    /// Optional wrapper; the pactl command line is passed as its last argument
    pub command_wrapper: Vec<String>,
    /// Per-command timeout in milliseconds
    pub timeout_ms: u64,
    /// Written into the module arguments of every route this engine creates
    pub owner_tag: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            program: "pactl".to_string(),
            command_wrapper: Vec::new(),
            timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            owner_tag: DEFAULT_OWNER_TAG.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Reconciliation loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Maximum gateway commands in flight during one dispatch phase
    pub max_concurrency: usize,
    /// Latency used when an intent does not specify one
    pub default_latency_ms: u32,
    /// Copy routes already loaded at startup into the desired graph
    pub adopt_existing: bool,
    /// Also unload orphaned loopbacks that this engine did not create
    pub remove_foreign_orphans: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            default_latency_ms: DEFAULT_LATENCY_MS,
            adopt_existing: true,
            remove_foreign_orphans: true,
        }
    }
}

impl ReconcilerConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Poller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub start_paused: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            start_paused: false,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// HTTP control surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl AppConfig {
    /// Default location: `<config dir>/loopback-router/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "loopback-router")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from an explicit path, or from the default location.
    ///
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.program.trim().is_empty() {
            return Err(ConfigError::Invalid("gateway.program is empty".into()));
        }
        if self.gateway.timeout_ms == 0 {
            return Err(ConfigError::Invalid("gateway.timeout_ms must be positive".into()));
        }
        if self.poller.interval_ms == 0 {
            return Err(ConfigError::Invalid("poller.interval_ms must be positive".into()));
        }
        if self.reconciler.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.max_concurrency must be positive".into(),
            ));
        }
        if self.reconciler.backoff_base_ms > self.reconciler.backoff_cap_ms {
            return Err(ConfigError::Invalid(format!(
                "reconciler.backoff_base_ms ({}) exceeds backoff_cap_ms ({})",
                self.reconciler.backoff_base_ms, self.reconciler.backoff_cap_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.gateway.program, "pactl");
        assert_eq!(config.reconciler.backoff_base_ms, 500);
        assert_eq!(config.reconciler.backoff_cap_ms, 8000);
        assert_eq!(config.poller.interval_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::from_toml(
            r#"
            [gateway]
            command_wrapper = ["flatpak-spawn", "--host", "sh", "-c"]

            [poller]
            interval_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.command_wrapper.len(), 4);
        assert_eq!(config.gateway.timeout_ms, DEFAULT_COMMAND_TIMEOUT_MS);
        assert_eq!(config.poller.interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = AppConfig::default();
        config.reconciler.backoff_base_ms = 10_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = AppConfig::default();
        config.poller.interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
