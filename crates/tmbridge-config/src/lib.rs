//! Layered TOML configuration for tmbridge.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tmbridge_core::{BridgeConfig, Readiness, RestartPolicy, WorkerConfig};
use tmbridge_types::ConfigError;

/// Environment the worker cannot run without: where the test-management
/// service lives and how to authenticate against it.
pub const DEFAULT_REQUIRED_ENV: &[&str] = &["TM_BASE_URL", "TM_API_TOKEN"];

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

/// `[worker]` section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub required_env: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
}

/// `[bridge]` section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub call_timeout_ms: Option<u64>,
    pub ready_wait_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub readiness: Option<Readiness>,
    pub restart: Option<RestartPolicy>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Explicit config file; unlike the default location it must exist.
    pub config_path: Option<PathBuf>,
    pub worker_command: Option<String>,
    pub worker_args: Option<Vec<String>>,
    pub call_timeout_ms: Option<u64>,
}

/// Load configuration from all sources, applying precedence rules.
///
/// Precedence (highest to lowest):
/// 1. CLI flags
/// 2. Environment variables
/// 3. Config file (`--config`, or `$TMBRIDGE_CONFIG_DIR/config.toml`)
/// 4. Defaults
pub fn load(overrides: CliOverrides) -> Result<BridgeConfig, ConfigError> {
    let settings = match &overrides.config_path {
        Some(path) => read_settings_file(path)?,
        None => {
            let path = config_dir().join("config.toml");
            if path.exists() {
                read_settings_file(&path)?
            } else {
                tracing::debug!("No config file at {}, using defaults", path.display());
                SettingsFile::default()
            }
        }
    };
    resolve(settings, overrides, |key| std::env::var(key).ok())
}

/// Merge settings, overrides and environment into a validated config.
///
/// `lookup_env` reads the process environment; it is a parameter so the
/// precedence rules can be exercised without touching real env vars.
pub fn resolve(
    settings: SettingsFile,
    overrides: CliOverrides,
    lookup_env: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let command = overrides
        .worker_command
        .or_else(|| lookup_env("TMBRIDGE_WORKER_COMMAND"))
        .or(settings.worker.command)
        .ok_or_else(|| ConfigError::MissingKey {
            key: "worker.command (pass --worker, set TMBRIDGE_WORKER_COMMAND, or add [worker] command to config.toml)".into(),
        })?;

    let args = overrides
        .worker_args
        .or(settings.worker.args)
        .unwrap_or_default();

    let call_timeout_ms = match overrides.call_timeout_ms {
        Some(ms) => ms,
        None => match lookup_env("TMBRIDGE_CALL_TIMEOUT_MS") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TMBRIDGE_CALL_TIMEOUT_MS".into(),
                message: format!("expected milliseconds, got '{raw}'"),
            })?,
            None => settings
                .bridge
                .call_timeout_ms
                .unwrap_or(tmbridge_core::config::DEFAULT_CALL_TIMEOUT_MS),
        },
    };
    if call_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            key: "call_timeout_ms".into(),
            message: "must be greater than zero".into(),
        });
    }

    let required_env = settings
        .worker
        .required_env
        .unwrap_or_else(|| DEFAULT_REQUIRED_ENV.iter().map(|k| k.to_string()).collect());

    // Required keys not pinned in the config file are taken from our own
    // environment and passed on explicitly.
    let mut env = settings.worker.env;
    for key in &required_env {
        if env.get(key).is_none_or(|v| v.is_empty()) {
            match lookup_env(key).filter(|v| !v.is_empty()) {
                Some(value) => {
                    env.insert(key.clone(), value);
                }
                None => return Err(ConfigError::MissingKey { key: key.clone() }),
            }
        }
    }

    let mut config = BridgeConfig::new(WorkerConfig {
        command,
        args,
        env,
        required_env,
        cwd: settings.worker.cwd,
    });
    config.call_timeout_ms = call_timeout_ms;
    if let Some(ms) = settings.bridge.ready_wait_ms {
        config.ready_wait_ms = ms;
    }
    if let Some(ms) = settings.bridge.shutdown_grace_ms {
        config.shutdown_grace_ms = ms;
    }
    if let Some(readiness) = settings.bridge.readiness {
        config.readiness = readiness;
    }
    if let Some(restart) = settings.bridge.restart {
        config.restart = restart;
    }

    Ok(config)
}

/// Get the tmbridge config directory path (~/.tmbridge/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TMBRIDGE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tmbridge")
}

/// Read and parse a TOML settings file.
fn read_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
