//! Error types for the loopback routing engine

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::RouteKey;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Intent error: {0}")]
    Intent(#[from] IntentError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Routing engine is not running")]
    EngineStopped,
}

/// Sound-server gateway errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Sound server unavailable: {0}")]
    Unavailable(String),

    #[error("Command `{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Create failed: {0}")]
    CreateFailed(String),

    #[error("Remove failed: {0}")]
    RemoveFailed(String),

    #[error("Config failed: {0}")]
    ConfigFailed(String),
}

/// Substrings the server uses when the target of a command is gone for good.
const PERMANENT_MARKERS: &[&str] = &[
    "no such entity",
    "does not exist",
    "module initialization failed",
    "no such",
];

impl GatewayError {
    /// Failures worth retrying with backoff while the route stays desired.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Timeout { .. } => true,
            GatewayError::CreateFailed(reason) | GatewayError::RemoveFailed(reason) => {
                !is_permanent_reason(reason)
            }
            GatewayError::ConfigFailed(_) => true,
            GatewayError::Unavailable(_) | GatewayError::Parse(_) => false,
        }
    }

    /// Failures that will not go away by retrying the same command.
    pub fn is_permanent(&self) -> bool {
        match self {
            GatewayError::CreateFailed(reason) | GatewayError::RemoveFailed(reason) => {
                is_permanent_reason(reason)
            }
            _ => false,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

fn is_permanent_reason(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    PERMANENT_MARKERS.iter().any(|marker| reason.contains(marker))
}

/// Intent submission errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentError {
    /// Accepted, but one of the route's endpoints is not in the last snapshot.
    #[error("Route {route} references an endpoint that is not present")]
    StaleIntent { route: RouteKey },

    #[error("Invalid route configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        let err = GatewayError::Timeout {
            command: "pactl list short modules".into(),
            after: Duration::from_secs(5),
        };
        assert!(err.is_transient());
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_missing_entity_is_permanent() {
        let err = GatewayError::CreateFailed("Failure: No such entity".into());
        assert!(err.is_permanent());
        assert!(!err.is_transient());

        let err = GatewayError::CreateFailed("Failure: Module initialization failed".into());
        assert!(err.is_permanent());
    }

    #[test]
    fn test_unknown_create_failure_is_transient() {
        let err = GatewayError::CreateFailed("Failure: Internal error".into());
        assert!(err.is_transient());
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_unavailable_is_neither() {
        let err = GatewayError::Unavailable("Connection refused".into());
        assert!(err.is_unavailable());
        assert!(!err.is_transient());
        assert!(!err.is_permanent());
    }
}
