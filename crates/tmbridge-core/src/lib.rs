//! Subprocess RPC bridge for tmbridge.
//!
//! Runs a long-lived worker process that speaks newline-delimited JSON over
//! stdin/stdout, and exposes a request/response [`Bridge::call`] on top of
//! it. Concurrent calls are correlated by their `id`; each call ends in
//! exactly one outcome (response, timeout, worker crash). A worker that
//! exits is respawned after the configured restart delay.

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod framing;
mod restart;
pub mod status;
pub mod supervisor;

pub use bridge::{Bridge, CallResponse};
pub use config::{BridgeConfig, Readiness, RestartPolicy, WorkerConfig};
pub use correlator::{Correlator, FailureReason, PendingCall};
pub use envelope::CallId;
pub use framing::{FramedReader, LineFramer};
pub use status::{BridgeStatus, WorkerState};
pub use supervisor::Supervisor;
pub use tmbridge_types::BridgeError;
