//! In-flight call tracking.
//!
//! Every request written to the worker is registered here under its
//! correlation id. Whichever of {matching response, deadline, worker exit,
//! caller abandonment} comes first removes the entry and settles the call;
//! all later attempts find nothing to settle and are no-ops.

use crate::envelope::CallId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tmbridge_types::BridgeError;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Why a call was failed in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The worker process exited.
    WorkerCrashed,
    /// The bridge is shutting down.
    ShuttingDown,
}

#[derive(Debug)]
enum Failure {
    Bulk(FailureReason),
    Timeout,
}

type Outcome = Result<Value, Failure>;

struct Entry {
    tx: oneshot::Sender<Outcome>,
}

/// The set of calls currently awaiting a response.
#[derive(Default)]
pub struct Correlator {
    inflight: Mutex<HashMap<CallId, Entry>>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, Entry>> {
        // Entries are inserted and removed whole; a panicking holder leaves
        // the map consistent.
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `id`. Fails if a call with the same id is in flight.
    pub fn register(self: &Arc<Self>, id: CallId) -> Result<PendingCall, BridgeError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inflight = self.lock();
            if inflight.contains_key(&id) {
                return Err(BridgeError::DuplicateId { id: id.to_string() });
            }
            inflight.insert(id.clone(), Entry { tx });
        }
        tracing::trace!(call_id = %id, "Registered call");

        Ok(PendingCall {
            id,
            submitted_at: Instant::now(),
            rx,
            correlator: Arc::clone(self),
            settled: false,
        })
    }

    /// Deliver a response. Returns `false` if no call with `id` is in flight.
    pub fn resolve(&self, id: &CallId, payload: Value) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Ok(payload));
                true
            }
            None => {
                tracing::debug!(call_id = %id, "Dropping response with no matching call");
                false
            }
        }
    }

    /// Fail every call currently in flight. Returns how many were failed.
    ///
    /// The set is swapped out under the lock, so calls registered afterwards
    /// are untouched.
    pub fn fail_all(&self, reason: FailureReason) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(Failure::Bulk(reason)));
        }
        count
    }

    /// Settle `id` as timed out if it is still in flight.
    pub fn expire(&self, id: &CallId) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Err(Failure::Timeout));
                true
            }
            None => false,
        }
    }

    /// Forget `id` without settling it. Used when the waiter has gone away.
    pub fn cancel(&self, id: &CallId) -> bool {
        self.lock().remove(id).is_some()
    }

    #[cfg(test)]
    fn contains(&self, id: &CallId) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of calls awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

/// Handle for one registered call.
///
/// Dropping it before it settles removes the registration, so an abandoned
/// caller never leaves a stale entry behind.
pub struct PendingCall {
    id: CallId,
    submitted_at: Instant,
    rx: oneshot::Receiver<Outcome>,
    correlator: Arc<Correlator>,
    settled: bool,
}

impl PendingCall {
    pub fn id(&self) -> &CallId {
        &self.id
    }

    /// Wait for the call to settle, at most `timeout` after registration.
    ///
    /// A `timeout` too large to represent as a deadline means no deadline.
    pub async fn wait(mut self, timeout: Duration) -> Result<Value, BridgeError> {
        let received = match self.submitted_at.checked_add(timeout) {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Whoever removed the entry (this expire, or a racing
                    // resolve or fail_all) sends exactly one outcome.
                    self.correlator.expire(&self.id);
                    (&mut self.rx).await
                }
            },
            None => (&mut self.rx).await,
        };
        self.settled = true;

        let Ok(outcome) = received else {
            // Sender dropped unsent: the entry was cancelled from outside.
            return Err(BridgeError::WorkerUnavailable);
        };
        match outcome {
            Ok(payload) => Ok(payload),
            Err(Failure::Timeout) => {
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(call_id = %self.id, timeout_ms, "Call timed out");
                Err(BridgeError::Timeout { timeout_ms })
            }
            Err(Failure::Bulk(FailureReason::WorkerCrashed)) => Err(BridgeError::WorkerCrashed),
            Err(Failure::Bulk(FailureReason::ShuttingDown)) => Err(BridgeError::ShuttingDown),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled && self.correlator.cancel(&self.id) {
            tracing::debug!(call_id = %self.id, "Caller abandoned call");
        }
    }
}
