//! Error hierarchy for tmbridge.

use thiserror::Error;

/// Errors surfaced by the worker bridge.
///
/// Every variant a caller can receive from a call is a distinct kind; see
/// [`BridgeError::kind`] for the stable name reported to outer surfaces.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Missing required worker configuration: {key}")]
    ConfigurationMissing { key: String },

    #[error("Invalid configuration: {0}")]
    Config(ConfigError),

    #[error("No live worker is available")]
    WorkerUnavailable,

    #[error("Worker exited while the call was outstanding")]
    WorkerCrashed,

    #[error("No response from worker within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Malformed worker message: {0}")]
    MalformedMessage(String),

    #[error("Call id {id} is already in flight")]
    DuplicateId { id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Bridge is shutting down")]
    ShuttingDown,

    #[error("Failed to spawn worker '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Stable snake_case name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::ConfigurationMissing { .. } => "configuration_missing",
            BridgeError::Config(_) => "invalid_configuration",
            BridgeError::WorkerUnavailable => "worker_unavailable",
            BridgeError::WorkerCrashed => "worker_crashed",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::MalformedMessage(_) => "malformed_message",
            BridgeError::DuplicateId { .. } => "duplicate_id",
            BridgeError::InvalidRequest(_) => "invalid_request",
            BridgeError::ShuttingDown => "shutting_down",
            BridgeError::Spawn { .. } => "spawn_failed",
            BridgeError::Json(_) => "json",
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::WorkerUnavailable | BridgeError::WorkerCrashed | BridgeError::Timeout { .. }
        )
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::MissingKey { key } => BridgeError::ConfigurationMissing { key },
            other => BridgeError::Config(other),
        }
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
