//! Worker lifecycle state and the bridge status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Spawned, readiness not yet established
    Starting,
    /// Accepting calls
    Ready,
    /// No live process (not yet spawned, exited, or shut down)
    #[default]
    Dead,
}

/// Point-in-time view of the bridge, for health endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub worker: WorkerState,
    /// OS process id of the live worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Number of workers spawned so far, including the live one.
    pub generation: u64,
    /// Number of times a worker exited and was scheduled for respawn.
    pub restarts: u64,
    pub in_flight: usize,
    /// When `worker` last changed.
    pub since: DateTime<Utc>,
}
