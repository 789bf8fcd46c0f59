//! Worker process supervisor.
//!
//! Keeps exactly one worker alive: spawns it, establishes readiness, routes
//! lines to its stdin and from its stdout, and respawns it after it exits.
//! Each spawned process is one *generation*; a new generation only starts
//! after the previous one has been reaped and its stdio tasks joined.

use crate::config::{BridgeConfig, Readiness};
use crate::correlator::{Correlator, FailureReason};
use crate::envelope::{CallId, Inbound, parse_line, probe_request};
use crate::framing::FramedReader;
use crate::restart::restart_delay;
use crate::status::{BridgeStatus, WorkerState};
use chrono::{DateTime, Utc};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tmbridge_types::util::PREVIEW_BYTES;
use tmbridge_types::{BridgeError, preview};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bound on joining a stdio task after its process is gone. A grandchild
/// that inherited the pipe can keep it open indefinitely.
const STDIO_DRAIN: Duration = Duration::from_secs(1);

const WRITE_QUEUE: usize = 64;

/// Lock a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Meta {
    pid: Option<u32>,
    generation: u64,
    restarts: u64,
    since: DateTime<Utc>,
}

/// How one generation ended.
enum Ended {
    NotReady(BridgeError),
    Exited(std::io::Result<ExitStatus>),
    Shutdown,
}

/// Owns the worker process and its stdio.
pub struct Supervisor {
    config: BridgeConfig,
    correlator: Arc<Correlator>,
    state: watch::Sender<WorkerState>,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    meta: Mutex<Meta>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Validate the worker configuration and start the supervision loop.
    ///
    /// Must be called from within a tokio runtime. Fails only on
    /// configuration problems; spawn failures are retried in the background.
    pub fn start(
        config: BridgeConfig,
        correlator: Arc<Correlator>,
    ) -> Result<Arc<Self>, BridgeError> {
        if let Some(key) = config.worker.missing_env() {
            return Err(BridgeError::ConfigurationMissing {
                key: key.to_string(),
            });
        }

        let (state, _) = watch::channel(WorkerState::Starting);
        let supervisor = Arc::new(Self {
            config,
            correlator,
            state,
            writer: Mutex::new(None),
            meta: Mutex::new(Meta {
                pid: None,
                generation: 0,
                restarts: 0,
                since: Utc::now(),
            }),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&supervisor).run());
        *lock(&supervisor.task) = Some(handle);
        Ok(supervisor)
    }

    /// Current worker state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch worker state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> BridgeStatus {
        let meta = lock(&self.meta);
        BridgeStatus {
            worker: self.state(),
            pid: meta.pid,
            generation: meta.generation,
            restarts: meta.restarts,
            in_flight: self.correlator.in_flight(),
            since: meta.since,
        }
    }

    /// Wait until the worker is ready.
    ///
    /// Returns immediately if the worker is `Ready`, fails immediately if it
    /// is `Dead`, and otherwise waits up to `timeout` for `Starting` to end.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), BridgeError> {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != WorkerState::Starting),
        )
        .await;
        match settled {
            Ok(Ok(state)) if *state == WorkerState::Ready => Ok(()),
            _ => Err(BridgeError::WorkerUnavailable),
        }
    }

    /// Write one message line to the worker's stdin.
    ///
    /// `line` must not contain a newline; the terminator is added here.
    pub async fn send(&self, line: String) -> Result<(), BridgeError> {
        if self.state() != WorkerState::Ready {
            return Err(BridgeError::WorkerUnavailable);
        }
        self.write(line).await
    }

    /// Ask the supervision loop to stop without waiting for it.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Stop the worker and the supervision loop.
    ///
    /// The worker's stdin is closed and it gets the configured grace period
    /// to exit before being killed. Outstanding calls fail with
    /// [`BridgeError::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Supervisor task failed");
            }
        }
    }

    async fn write(&self, line: String) -> Result<(), BridgeError> {
        let tx = lock(&self.writer)
            .clone()
            .ok_or(BridgeError::WorkerUnavailable)?;
        tx.send(line)
            .await
            .map_err(|_| BridgeError::WorkerUnavailable)
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            lock(&self.meta).since = Utc::now();
            tracing::debug!(?previous, ?state, "Worker state changed");
        }
    }

    async fn run(self: Arc<Self>) {
        let mut failures: u32 = 0;

        while !self.shutdown.is_cancelled() {
            let generation = {
                let mut meta = lock(&self.meta);
                meta.generation += 1;
                meta.generation
            };

            let Some(reached_ready) = self.run_generation(generation).await else {
                break;
            };
            if reached_ready {
                failures = 0;
            }
            let delay = restart_delay(&self.config.restart, failures);
            if !reached_ready {
                failures = failures.saturating_add(1);
            }

            lock(&self.meta).restarts += 1;
            tracing::info!(
                generation,
                delay_ms = delay.as_millis() as u64,
                "Restarting worker after delay"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(WorkerState::Dead);
        let failed = self.correlator.fail_all(FailureReason::ShuttingDown);
        if failed > 0 {
            tracing::info!(failed, "Failed outstanding calls on shutdown");
        }
        tracing::debug!("Supervisor stopped");
    }

    /// Run one worker process from spawn to reap.
    ///
    /// Returns whether it reached `Ready`, or `None` if it ended because of
    /// shutdown.
    async fn run_generation(&self, generation: u64) -> Option<bool> {
        self.set_state(WorkerState::Starting);

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(generation, error = %e, "Failed to spawn worker");
                self.set_state(WorkerState::Dead);
                return Some(false);
            }
        };
        let pid = child.id();
        lock(&self.meta).pid = pid;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            tracing::error!(generation, "Worker spawned without piped stdio");
            let _ = child.kill().await;
            lock(&self.meta).pid = None;
            self.set_state(WorkerState::Dead);
            return Some(false);
        };

        let (write_tx, write_rx) = mpsc::channel::<String>(WRITE_QUEUE);
        let writer = tokio::spawn(write_loop(stdin, write_rx, generation));
        let reader = tokio::spawn(read_loop(stdout, Arc::clone(&self.correlator), generation));
        let stderr = tokio::spawn(log_stderr(stderr, generation));
        *lock(&self.writer) = Some(write_tx);
        tracing::info!(generation, pid, command = %self.config.worker.command, "Worker spawned");

        let before_ready = tokio::select! {
            status = child.wait() => Some(Ended::Exited(status)),
            _ = self.shutdown.cancelled() => Some(Ended::Shutdown),
            ready = self.establish_readiness(generation) => ready.err().map(Ended::NotReady),
        };

        let reached_ready = before_ready.is_none();
        let ended = match before_ready {
            Some(ended) => ended,
            None => {
                self.set_state(WorkerState::Ready);
                tracing::info!(generation, pid, "Worker ready");
                tokio::select! {
                    status = child.wait() => Ended::Exited(status),
                    _ = self.shutdown.cancelled() => Ended::Shutdown,
                }
            }
        };

        // No new writes from here on; dropping the sender closes stdin once
        // the queue drains.
        self.set_state(WorkerState::Dead);
        drop(lock(&self.writer).take());

        let shutting_down = match ended {
            Ended::Exited(Ok(status)) => {
                tracing::warn!(generation, pid, %status, "Worker exited");
                false
            }
            Ended::Exited(Err(e)) => {
                tracing::warn!(generation, pid, error = %e, "Lost track of worker process");
                let _ = child.kill().await;
                false
            }
            Ended::NotReady(e) => {
                tracing::warn!(generation, pid, error = %e, "Worker failed readiness check");
                let _ = child.kill().await;
                false
            }
            Ended::Shutdown => {
                self.stop_child(&mut child, generation).await;
                true
            }
        };

        join_stdio(writer, "stdin", generation).await;
        join_stdio(reader, "stdout", generation).await;
        join_stdio(stderr, "stderr", generation).await;
        lock(&self.meta).pid = None;

        let reason = if shutting_down {
            FailureReason::ShuttingDown
        } else {
            FailureReason::WorkerCrashed
        };
        let failed = self.correlator.fail_all(reason);
        if failed > 0 {
            tracing::warn!(generation, failed, ?reason, "Failed in-flight calls");
        }

        (!shutting_down).then_some(reached_ready)
    }

    fn spawn_child(&self) -> Result<Child, BridgeError> {
        let worker = &self.config.worker;
        let mut cmd = Command::new(&worker.command);
        cmd.args(&worker.args)
            .envs(&worker.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &worker.cwd {
            cmd.current_dir(cwd);
        }

        cmd.spawn().map_err(|source| BridgeError::Spawn {
            command: worker.command.clone(),
            source,
        })
    }

    async fn establish_readiness(&self, generation: u64) -> Result<(), BridgeError> {
        match &self.config.readiness {
            Readiness::Delay { warmup_ms } => {
                tokio::time::sleep(Duration::from_millis(*warmup_ms)).await;
                Ok(())
            }
            Readiness::Handshake { method, timeout_ms } => {
                let id = CallId::Text(format!("tmbridge-ready-{generation}"));
                let probe = self.correlator.register(id.clone())?;
                let line = serde_json::to_string(&probe_request(&id, method))?;
                self.write(line).await?;
                probe.wait(Duration::from_millis(*timeout_ms)).await?;
                Ok(())
            }
        }
    }

    /// Close stdin (already done by the caller), wait the grace period, then kill.
    async fn stop_child(&self, child: &mut Child, generation: u64) {
        let grace = self.config.shutdown_grace();
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!(generation, %status, "Worker stopped"),
            Ok(Err(e)) => tracing::warn!(generation, error = %e, "Failed to wait for worker"),
            Err(_) => {
                tracing::warn!(
                    generation,
                    grace_ms = grace.as_millis() as u64,
                    "Worker ignored stdin close, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::error!(generation, error = %e, "Failed to kill worker");
                }
            }
        }
    }
}

async fn join_stdio(mut handle: JoinHandle<()>, stream: &'static str, generation: u64) {
    if tokio::time::timeout(STDIO_DRAIN, &mut handle).await.is_err() {
        tracing::debug!(generation, stream, "Stdio task still busy after exit, aborting");
        handle.abort();
        let _ = handle.await;
    }
}

/// Drain the write queue into the worker's stdin, one line per message.
async fn write_loop(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>, generation: u64) {
    while let Some(line) = rx.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::debug!(generation, error = %e, "Worker stdin closed");
            break;
        }
    }
}

/// Feed worker stdout through the framer and hand each line to the correlator.
async fn read_loop(stdout: ChildStdout, correlator: Arc<Correlator>, generation: u64) {
    let mut lines = FramedReader::new(stdout);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_line(&correlator, &line),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(generation, error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
    tracing::debug!(generation, "Worker stdout closed");
}

/// Route one stdout line. Anything that is not an id-bearing JSON object is
/// incidental output and is dropped.
pub(crate) fn dispatch_line(correlator: &Correlator, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match parse_line(line) {
        Ok(Inbound {
            id: Some(id),
            message,
        }) => {
            correlator.resolve(&id, message);
        }
        Ok(Inbound { id: None, .. }) => {
            tracing::debug!(line = %preview(line, PREVIEW_BYTES), "Ignoring worker message without id");
        }
        Err(e) => {
            tracing::debug!(line = %preview(line, PREVIEW_BYTES), error = %e, "Discarding non-message output");
        }
    }
}

/// Surface worker stderr as log events. Never parsed.
async fn log_stderr(stderr: impl AsyncRead + Unpin, generation: u64) {
    let mut lines = FramedReader::new(stderr);
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::info!(target: "tmbridge::worker", generation, "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::framing::LineFramer;
    use serde_json::json;

    fn sh(script: &str) -> BridgeConfig {
        let mut config = BridgeConfig::new(WorkerConfig::new("sh").with_args(["-c", script]));
        config.readiness = Readiness::Delay { warmup_ms: 20 };
        config.restart = crate::config::RestartPolicy::Fixed { delay_ms: 50 };
        config.shutdown_grace_ms = 500;
        config
    }

    #[tokio::test]
    async fn dispatch_split_stream_end_to_end() {
        let correlator = Correlator::new();
        let call = correlator.register(CallId::from("A")).unwrap();

        let mut framer = LineFramer::new();
        for chunk in [
            &b"{\"id\":\"A\",\"result\":\"ok\"}\n{\"i"[..],
            &b"d\":\"B\",\"result\":\"x\"}\n"[..],
        ] {
            for line in framer.feed(chunk) {
                dispatch_line(&correlator, &line);
            }
        }

        let payload = call.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(payload["result"], "ok");
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn dispatch_tolerates_noise() {
        let correlator = Correlator::new();
        let call = correlator.register(CallId::Number(1)).unwrap();
        for line in [
            "",
            "   ",
            "Listening on stdio...",
            "{not json",
            "[1,2]",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}",
        ] {
            dispatch_line(&correlator, line);
        }
        assert_eq!(correlator.in_flight(), 1);
        dispatch_line(&correlator, "{\"id\":1,\"result\":true}");
        assert_eq!(call.wait(Duration::from_secs(1)).await.unwrap()["result"], true);
    }

    #[tokio::test]
    async fn missing_required_env_is_fatal() {
        let mut config = sh("cat");
        config.worker.required_env = vec!["TM_API_TOKEN".into()];
        match Supervisor::start(config, Correlator::new()) {
            Err(BridgeError::ConfigurationMissing { key }) => assert_eq!(key, "TM_API_TOKEN"),
            Err(other) => panic!("Expected ConfigurationMissing, got: {other:?}"),
            Ok(_) => panic!("Expected error, got Ok"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn becomes_ready_after_warmup() {
        let supervisor = Supervisor::start(sh("cat"), Correlator::new()).unwrap();
        assert_eq!(supervisor.state(), WorkerState::Starting);
        supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();
        let status = supervisor.status();
        assert_eq!(status.worker, WorkerState::Ready);
        assert!(status.pid.is_some());
        assert_eq!(status.generation, 1);
        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), WorkerState::Dead);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn send_before_ready_is_unavailable() {
        let mut config = sh("cat");
        config.readiness = Readiness::Delay { warmup_ms: 5_000 };
        let supervisor = Supervisor::start(config, Correlator::new()).unwrap();
        assert!(matches!(
            supervisor.send("{}".into()).await,
            Err(BridgeError::WorkerUnavailable)
        ));
        supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_marks_ready() {
        let mut config = sh("cat");
        config.readiness = Readiness::Handshake {
            method: "ping".into(),
            timeout_ms: 5_000,
        };
        let correlator = Correlator::new();
        let supervisor = Supervisor::start(config, Arc::clone(&correlator)).unwrap();
        supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();
        // Probe registration is gone once answered.
        assert_eq!(correlator.in_flight(), 0);
        supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_worker_fails_handshake_and_restarts() {
        let mut config = sh("exec cat > /dev/null");
        config.readiness = Readiness::Handshake {
            method: "ping".into(),
            timeout_ms: 50,
        };
        let supervisor = Supervisor::start(config, Correlator::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = supervisor.status();
        assert_ne!(status.worker, WorkerState::Ready);
        assert!(status.restarts >= 1, "restarts = {}", status.restarts);
        supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_fails_in_flight_calls_and_respawns() {
        let correlator = Correlator::new();
        let supervisor =
            Supervisor::start(sh("read -r line; exit 3"), Arc::clone(&correlator)).unwrap();
        supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();

        let call = correlator.register(CallId::from("doomed")).unwrap();
        supervisor
            .send(json!({"id": "doomed"}).to_string())
            .await
            .unwrap();
        assert!(matches!(
            call.wait(Duration::from_secs(5)).await,
            Err(BridgeError::WorkerCrashed)
        ));

        let mut rx = supervisor.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == WorkerState::Ready),
        )
        .await
        .unwrap()
        .unwrap();
        let status = supervisor.status();
        assert!(status.generation >= 2);
        assert!(status.restarts >= 1);
        supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_is_retried() {
        let mut config = sh("cat");
        config.worker.command = "this_command_does_not_exist_xyz123".into();
        let supervisor = Supervisor::start(config, Correlator::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = supervisor.status();
        assert_eq!(status.worker, WorkerState::Dead);
        assert!(status.generation >= 2, "generation = {}", status.generation);
        assert!(matches!(
            supervisor.wait_ready(Duration::from_millis(10)).await,
            Err(BridgeError::WorkerUnavailable)
        ));
        supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_fails_outstanding_calls() {
        let correlator = Correlator::new();
        let supervisor =
            Supervisor::start(sh("exec cat > /dev/null"), Arc::clone(&correlator)).unwrap();
        supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();

        let call = correlator.register(CallId::from("pending")).unwrap();
        supervisor.shutdown().await;
        assert!(matches!(
            call.wait(Duration::from_secs(5)).await,
            Err(BridgeError::ShuttingDown)
        ));
        assert!(matches!(
            supervisor.send("{}".into()).await,
            Err(BridgeError::WorkerUnavailable)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stubborn_worker_is_killed_on_shutdown() {
        let supervisor =
            Supervisor::start(sh("trap '' TERM; while :; do sleep 1; done"), Correlator::new())
                .unwrap();
        supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .unwrap();
        assert_eq!(supervisor.status().pid, None);
    }
}
