//! Public call interface.
//!
//! [`Bridge`] is what an outer surface (an HTTP handler, the CLI) holds: it
//! owns the supervisor and the correlator and turns one request value into
//! one terminal outcome.

use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::envelope::{CallId, prepare_request};
use crate::status::{BridgeStatus, WorkerState};
use crate::supervisor::Supervisor;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tmbridge_types::BridgeError;
use tokio::sync::watch;

/// The worker's reply to one call, passed through untouched.
#[derive(Debug, Clone, Serialize)]
pub struct CallResponse {
    id: CallId,
    message: Value,
}

impl CallResponse {
    pub fn id(&self) -> &CallId {
        &self.id
    }

    /// The full response object as the worker wrote it.
    pub fn message(&self) -> &Value {
        &self.message
    }

    /// The `result` member, if the worker sent one.
    pub fn result(&self) -> Option<&Value> {
        self.message.get("result")
    }

    /// The `error` member, if the worker sent one.
    pub fn error(&self) -> Option<&Value> {
        self.message.get("error")
    }

    pub fn into_message(self) -> Value {
        self.message
    }
}

/// Request/response bridge to a supervised worker process.
pub struct Bridge {
    supervisor: Arc<Supervisor>,
    correlator: Arc<Correlator>,
    call_timeout: Duration,
    ready_wait: Duration,
}

impl Bridge {
    /// Validate `config` and start supervising the worker.
    ///
    /// Returns as soon as the supervisor is running; use
    /// [`Bridge::wait_ready`] to block until the first worker is ready.
    /// Must be called from within a tokio runtime.
    pub fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        let call_timeout = config.call_timeout();
        let ready_wait = config.ready_wait();
        let correlator = Correlator::new();
        let supervisor = Supervisor::start(config, Arc::clone(&correlator))?;

        Ok(Self {
            supervisor,
            correlator,
            call_timeout,
            ready_wait,
        })
    }

    /// Submit a request and wait for its correlated response.
    ///
    /// `request` must be a JSON object. Its `id` is used for correlation; one
    /// is generated if absent. The deadline is the configured call timeout.
    pub async fn call(&self, request: Value) -> Result<CallResponse, BridgeError> {
        self.call_with_timeout(request, self.call_timeout).await
    }

    /// Like [`Bridge::call`], with an explicit deadline.
    pub async fn call_with_timeout(
        &self,
        request: Value,
        timeout: Duration,
    ) -> Result<CallResponse, BridgeError> {
        let (id, line) = prepare_request(request)?;
        self.supervisor.wait_ready(self.ready_wait).await?;

        let pending = self.correlator.register(id.clone())?;
        tracing::debug!(call_id = %id, "Sending call to worker");
        // On failure `pending` is dropped here, which removes the registration.
        self.supervisor.send(line).await?;

        let message = pending.wait(timeout).await?;
        Ok(CallResponse { id, message })
    }

    /// Wait for a ready worker, up to the configured ready wait.
    pub async fn wait_ready(&self) -> Result<(), BridgeError> {
        self.supervisor.wait_ready(self.ready_wait).await
    }

    pub fn is_ready(&self) -> bool {
        self.supervisor.state() == WorkerState::Ready
    }

    pub fn status(&self) -> BridgeStatus {
        self.supervisor.status()
    }

    /// Watch worker state transitions.
    pub fn state_changes(&self) -> watch::Receiver<WorkerState> {
        self.supervisor.subscribe()
    }

    /// Number of calls awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.correlator.in_flight()
    }

    /// Stop the worker gracefully and fail outstanding calls.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // The supervision task holds its own reference; tell it to stop.
        self.supervisor.cancel();
    }
}
