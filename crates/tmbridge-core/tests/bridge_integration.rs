//! End-to-end tests for `Bridge` against real worker processes.
//!
//! Workers are small `sh` scripts; `cat` doubles as an echo worker since the
//! echoed request carries its own `id`.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tmbridge_core::{
    Bridge, BridgeConfig, BridgeError, Readiness, RestartPolicy, WorkerConfig, WorkerState,
};

const WAIT: Duration = Duration::from_secs(5);

fn sh_config(script: &str) -> BridgeConfig {
    let mut config = BridgeConfig::new(WorkerConfig::new("sh").with_args(["-c", script]));
    config.readiness = Readiness::Delay { warmup_ms: 20 };
    config.restart = RestartPolicy::Fixed { delay_ms: 100 };
    config.ready_wait_ms = 2_000;
    config.shutdown_grace_ms = 500;
    config
}

async fn ready_bridge(script: &str) -> Bridge {
    let bridge = Bridge::start(sh_config(script)).unwrap();
    bridge.wait_ready().await.unwrap();
    bridge
}

async fn wait_for_state(bridge: &Bridge, state: WorkerState) {
    let mut rx = bridge.state_changes();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("state change timed out")
        .unwrap();
}

#[tokio::test]
async fn echo_worker_round_trip() {
    let bridge = ready_bridge("exec cat").await;
    let response = bridge
        .call(json!({"id": "A", "method": "get_test_case", "params": {"key": "TC-1"}}))
        .await
        .unwrap();
    assert_eq!(response.id().to_string(), "A");
    assert_eq!(response.message()["params"]["key"], "TC-1");
    assert_eq!(bridge.in_flight(), 0);
    bridge.shutdown().await;
}

#[tokio::test]
async fn generated_id_is_echoed_back() {
    let bridge = ready_bridge("exec cat").await;
    let response = bridge.call(json!({"method": "list_projects"})).await.unwrap();
    assert_eq!(response.message()["id"], response.id().to_value());
    bridge.shutdown().await;
}

#[tokio::test]
async fn handshake_readiness_with_noisy_worker() {
    let mut config = sh_config(
        r#"echo "worker booting" >&2; echo "Test management worker listening on stdio"; exec cat"#,
    );
    config.readiness = Readiness::Handshake {
        method: "ping".into(),
        timeout_ms: 5_000,
    };
    let bridge = Bridge::start(config).unwrap();
    bridge.wait_ready().await.unwrap();
    assert!(bridge.is_ready());

    let response = bridge.call(json!({"id": 1, "method": "m"})).await.unwrap();
    assert_eq!(response.message()["id"], 1);
    bridge.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_response() {
    let bridge = Arc::new(ready_bridge("exec cat").await);

    let mut handles = Vec::new();
    for n in 0..20 {
        let bridge = Arc::clone(&bridge);
        handles.push(tokio::spawn(async move {
            let response = bridge
                .call(json!({"id": format!("call-{n}"), "params": {"n": n}}))
                .await
                .unwrap();
            (n, response)
        }));
    }

    for handle in handles {
        let (n, response) = handle.await.unwrap();
        assert_eq!(response.id().to_string(), format!("call-{n}"));
        assert_eq!(response.message()["params"]["n"], n);
    }
    assert_eq!(bridge.in_flight(), 0);
    bridge.shutdown().await;
}

#[tokio::test]
async fn reordered_responses_are_matched_by_id() {
    let bridge = ready_bridge(r#"read -r a; read -r b; printf '%s\n%s\n' "$b" "$a"; exec cat"#).await;

    let (first, second) = tokio::join!(
        bridge.call(json!({"id": "first", "v": 1})),
        bridge.call(json!({"id": "second", "v": 2})),
    );
    assert_eq!(first.unwrap().message()["v"], 1);
    assert_eq!(second.unwrap().message()["v"], 2);
    bridge.shutdown().await;
}

#[tokio::test]
async fn split_output_and_stray_response() {
    let bridge = ready_bridge(
        r#"read -r line; printf '{"id":"A","result":"ok"}\n{"i'; sleep 0.2; printf 'd":"B","result":"x"}\n'; exec cat"#,
    )
    .await;

    let response = bridge.call(json!({"id": "A"})).await.unwrap();
    assert_eq!(response.result(), Some(&json!("ok")));

    // The stray "B" line is dropped and the reader keeps going.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = bridge.call(json!({"id": "C", "result": "echo"})).await.unwrap();
    assert_eq!(response.result(), Some(&json!("echo")));
    assert_eq!(bridge.in_flight(), 0);
    bridge.shutdown().await;
}

#[tokio::test]
async fn unknown_id_does_not_disturb_pending_call() {
    let bridge = ready_bridge(
        r#"read -r a; printf '{"id":"ghost","result":1}\n'; printf '%s\n' "$a"; exec cat"#,
    )
    .await;
    let response = bridge.call(json!({"id": "real", "result": 2})).await.unwrap();
    assert_eq!(response.result(), Some(&json!(2)));
    bridge.shutdown().await;
}

#[tokio::test]
async fn worker_exit_fails_all_outstanding_calls() {
    let bridge = ready_bridge("read -r a; read -r b; read -r c; exit 1").await;

    let (a, b, c) = tokio::join!(
        bridge.call(json!({"id": "a"})),
        bridge.call(json!({"id": "b"})),
        bridge.call(json!({"id": "c"})),
    );
    for result in [a, b, c] {
        match result {
            Err(BridgeError::WorkerCrashed) => {}
            other => panic!("Expected WorkerCrashed, got: {other:?}"),
        }
    }
    assert_eq!(bridge.in_flight(), 0);
    bridge.shutdown().await;
}

#[tokio::test]
async fn worker_is_respawned_after_crash() {
    let marker = std::env::temp_dir().join(format!("tmbridge-crash-{}", uuid::Uuid::new_v4()));
    let script = format!(
        r#"if [ -f '{m}' ]; then exec cat; else touch '{m}'; read -r a; exit 1; fi"#,
        m = marker.display()
    );
    let bridge = ready_bridge(&script).await;

    assert!(matches!(
        bridge.call(json!({"id": "first"})).await,
        Err(BridgeError::WorkerCrashed)
    ));

    wait_for_state(&bridge, WorkerState::Ready).await;
    let response = bridge.call(json!({"id": "second"})).await.unwrap();
    assert_eq!(response.message()["id"], "second");

    let status = bridge.status();
    assert_eq!(status.generation, 2);
    assert_eq!(status.restarts, 1);
    bridge.shutdown().await;
    let _ = std::fs::remove_file(marker);
}

#[tokio::test]
async fn timeout_is_isolated_from_other_calls() {
    let bridge =
        ready_bridge(r#"read -r a; read -r b; printf '%s\n' "$b"; exec cat > /dev/null"#).await;

    let (slow, fast) = tokio::join!(
        bridge.call_with_timeout(json!({"id": "slow"}), Duration::from_millis(200)),
        bridge.call_with_timeout(json!({"id": "fast"}), WAIT),
    );
    match slow {
        Err(BridgeError::Timeout { timeout_ms }) => assert_eq!(timeout_ms, 200),
        other => panic!("Expected Timeout, got: {other:?}"),
    }
    assert_eq!(fast.unwrap().message()["id"], "fast");
    assert_eq!(bridge.in_flight(), 0);
    bridge.shutdown().await;
}

#[tokio::test]
async fn duplicate_in_flight_id_is_rejected() {
    let bridge = ready_bridge("exec cat > /dev/null").await;

    let first = bridge.call_with_timeout(json!({"id": "dup"}), Duration::from_millis(300));
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge.call(json!({"id": "dup"})).await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first, Err(BridgeError::Timeout { .. })));
    match second {
        Err(BridgeError::DuplicateId { id }) => assert_eq!(id, "dup"),
        other => panic!("Expected DuplicateId, got: {other:?}"),
    }
    bridge.shutdown().await;
}

#[tokio::test]
async fn no_worker_means_unavailable() {
    let mut config = sh_config("exec cat");
    config.worker.command = "this_command_does_not_exist_xyz123".into();
    config.restart = RestartPolicy::Fixed { delay_ms: 5_000 };
    let bridge = Bridge::start(config).unwrap();

    match bridge.call(json!({"id": "x"})).await {
        Err(BridgeError::WorkerUnavailable) => {}
        other => panic!("Expected WorkerUnavailable, got: {other:?}"),
    }
    assert_eq!(bridge.status().worker, WorkerState::Dead);
    assert_eq!(bridge.in_flight(), 0);
    bridge.shutdown().await;
}

#[tokio::test]
async fn abandoned_call_is_cleaned_up() {
    let bridge = ready_bridge("exec cat > /dev/null").await;

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), bridge.call(json!({"id": "gone"}))).await;
    assert!(abandoned.is_err());
    assert_eq!(bridge.in_flight(), 0);

    // The id is free again.
    let retry =
        bridge.call_with_timeout(json!({"id": "gone"}), Duration::from_millis(50)).await;
    assert!(matches!(retry, Err(BridgeError::Timeout { .. })));
    bridge.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_pending_and_rejects_new_calls() {
    let bridge = Arc::new(ready_bridge("exec cat > /dev/null").await);

    let pending = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.call(json!({"id": "pending"})).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.in_flight(), 1);

    bridge.shutdown().await;
    assert!(matches!(
        pending.await.unwrap(),
        Err(BridgeError::ShuttingDown)
    ));
    assert!(matches!(
        bridge.call(json!({"id": "late"})).await,
        Err(BridgeError::WorkerUnavailable)
    ));
    assert_eq!(bridge.status().worker, WorkerState::Dead);
}
