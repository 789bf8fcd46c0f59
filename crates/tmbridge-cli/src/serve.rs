//! Line-oriented serve mode: one JSON request per stdin line, one JSON
//! outcome per stdout line.

use anyhow::Result;
use serde_json::{Value, json};
use std::sync::Arc;
use tmbridge_core::{Bridge, BridgeError, CallId, FramedReader};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Serve requests from stdin until EOF or Ctrl-C, then wait for the
/// outstanding calls to finish.
pub async fn serve(bridge: Arc<Bridge>) -> Result<()> {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

    // Single writer so concurrent outcomes never interleave on stdout.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = FramedReader::new(tokio::io::stdin());
    let mut calls = JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let bridge = Arc::clone(&bridge);
                    let out_tx = out_tx.clone();
                    calls.spawn(async move {
                        if let Some(outcome) = handle_line(&bridge, &line).await {
                            let _ = out_tx.send(outcome).await;
                        }
                    });
                }
                Ok(None) => {
                    tracing::debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, finishing outstanding calls");
                break;
            }
        }
    }

    while calls.join_next().await.is_some() {}
    drop(out_tx);
    writer.await??;
    Ok(())
}

/// Run one request line through the bridge and render its outcome.
async fn handle_line(bridge: &Bridge, line: &str) -> Option<String> {
    if line.trim().is_empty() {
        return None;
    }
    let request = match parse_request(line) {
        Ok(request) => request,
        Err(message) => {
            return Some(error_line(&Value::Null, &BridgeError::InvalidRequest(message)));
        }
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    match bridge.call(request).await {
        Ok(response) => Some(response.into_message().to_string()),
        Err(e) => {
            tracing::debug!(%id, kind = e.kind(), "Call failed");
            Some(error_line(&id, &e))
        }
    }
}

/// Parse a request line, giving it an id if it has none so that even a
/// failure can be attributed by the client.
pub fn parse_request(line: &str) -> Result<Value, String> {
    let mut request: Value =
        serde_json::from_str(line).map_err(|e| format!("request is not valid JSON: {e}"))?;
    let Value::Object(ref mut object) = request else {
        return Err("request must be a JSON object".to_string());
    };
    if object.get("id").is_none_or(Value::is_null) {
        object.insert("id".to_string(), CallId::generate().to_value());
    }
    Ok(request)
}

/// Render a failed call.
pub fn error_line(id: &Value, err: &BridgeError) -> String {
    json!({
        "id": id,
        "error": {
            "kind": err.kind(),
            "message": err.to_string(),
            "retryable": err.is_retryable(),
        }
    })
    .to_string()
}
