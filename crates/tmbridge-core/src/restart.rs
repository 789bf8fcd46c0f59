//! Respawn delay calculation for the worker supervisor.

use crate::config::RestartPolicy;
use rand::Rng;
use std::time::Duration;

/// Delay before respawning after `failures` consecutive failed generations.
///
/// `failures` starts at 0 for the first restart after a worker that had
/// reached ready. The fixed policy ignores it. The exponential policy computes
/// `initial_delay_ms * backoff_factor^failures` with ±25% jitter, clamped to
/// `max_delay_ms`.
pub fn restart_delay(policy: &RestartPolicy, failures: u32) -> Duration {
    match policy {
        RestartPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
        RestartPolicy::Exponential {
            initial_delay_ms,
            max_delay_ms,
            backoff_factor,
        } => {
            let exponent = failures.min(i32::MAX as u32) as i32;
            let base = *initial_delay_ms as f64 * backoff_factor.powi(exponent);
            let clamped = base.min(*max_delay_ms as f64);

            let jitter_factor = rand::rng().random_range(0.75..=1.25);
            let jittered = (clamped * jitter_factor) as u64;

            Duration::from_millis(jittered.min(*max_delay_ms))
        }
    }
}
