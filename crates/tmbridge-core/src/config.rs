//! Configuration types for the worker bridge.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default per-call deadline. Upstream test-management operations
/// (bulk result uploads, report generation) can take minutes.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 300_000;

/// Default time a call waits for a `Starting` worker to become ready.
pub const DEFAULT_READY_WAIT_MS: u64 = 10_000;

/// Default fixed delay between a worker exit and its respawn.
pub const DEFAULT_RESTART_DELAY_MS: u64 = 5_000;

/// Default grace period for the worker to exit after stdin is closed.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_ready_wait() -> u64 {
    DEFAULT_READY_WAIT_MS
}

fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_probe_method() -> String {
    "ping".to_string()
}

fn default_handshake_timeout() -> u64 {
    30_000
}

fn default_restart_delay() -> u64 {
    DEFAULT_RESTART_DELAY_MS
}

fn default_backoff_factor() -> f64 {
    2.0
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub worker: WorkerConfig,
    /// Deadline for every call, measured from registration.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// How long a call waits for a `Starting` worker before giving up.
    #[serde(default = "default_ready_wait")]
    pub ready_wait_ms: u64,
    #[serde(default)]
    pub readiness: Readiness,
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Time the worker gets to exit on its own after stdin is closed.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl BridgeConfig {
    /// Configuration with defaults for everything but the worker.
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            worker,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            ready_wait_ms: DEFAULT_READY_WAIT_MS,
            readiness: Readiness::default(),
            restart: RestartPolicy::default(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ready_wait(&self) -> Duration {
        Duration::from_millis(self.ready_wait_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// How to launch the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Command to run (e.g., "node", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables set for the worker process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Keys that must be present in `env` before the worker may start.
    #[serde(default)]
    pub required_env: Vec<String>,
    /// Working directory for the worker (defaults to the bridge's own).
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            required_env: Vec::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the first required key missing from `env`, if any.
    pub fn missing_env(&self) -> Option<&str> {
        self.required_env
            .iter()
            .find(|key| self.env.get(key.as_str()).is_none_or(|v| v.is_empty()))
            .map(String::as_str)
    }
}

/// How the supervisor decides a freshly spawned worker is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Readiness {
    /// Send a probe request and wait for any correlated reply.
    Handshake {
        #[serde(default = "default_probe_method")]
        method: String,
        #[serde(default = "default_handshake_timeout")]
        timeout_ms: u64,
    },
    /// Assume readiness after a fixed warm-up delay.
    Delay { warmup_ms: u64 },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::Handshake {
            method: default_probe_method(),
            timeout_ms: default_handshake_timeout(),
        }
    }
}

/// Delay schedule between a worker exit and the next spawn attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Same delay after every exit.
    Fixed {
        #[serde(default = "default_restart_delay")]
        delay_ms: u64,
    },
    /// Delay grows with consecutive failed generations.
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        #[serde(default = "default_backoff_factor")]
        backoff_factor: f64,
    },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Fixed {
            delay_ms: DEFAULT_RESTART_DELAY_MS,
        }
    }
}
