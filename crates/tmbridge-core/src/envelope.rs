//! Line-level message envelope shared with the worker.
//!
//! The bridge only looks at the `id` member of each message; everything else
//! is passed through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tmbridge_types::BridgeError;

/// Correlation identifier, as it appears in the `id` member of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallId {
    Number(i64),
    Text(String),
}

impl CallId {
    /// A fresh identifier that cannot collide with other generated ones.
    pub fn generate() -> Self {
        CallId::Text(format!("tmb-{}", uuid::Uuid::new_v4()))
    }

    /// Read an identifier from a JSON value. Only strings and integers qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(CallId::Text(s.clone())),
            Value::Number(n) => n.as_i64().map(CallId::Number),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            CallId::Number(n) => Value::from(*n),
            CallId::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallId::Number(n) => write!(f, "{n}"),
            CallId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        CallId::Text(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        CallId::Text(s)
    }
}

impl From<i64> for CallId {
    fn from(n: i64) -> Self {
        CallId::Number(n)
    }
}

/// A message read from the worker's stdout.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// `None` for objects that carry no usable `id` (notifications).
    pub id: Option<CallId>,
    pub message: Value,
}

/// Parse one line of worker output.
///
/// Anything that is not a JSON object is reported as
/// [`BridgeError::MalformedMessage`]; the caller decides to log and drop it.
pub fn parse_line(line: &str) -> Result<Inbound, BridgeError> {
    let message: Value = serde_json::from_str(line)
        .map_err(|e| BridgeError::MalformedMessage(e.to_string()))?;
    let Value::Object(ref object) = message else {
        return Err(BridgeError::MalformedMessage(
            "message is not a JSON object".to_string(),
        ));
    };
    let id = object.get("id").and_then(CallId::from_value);
    Ok(Inbound { id, message })
}

/// Validate an outgoing request and make sure it carries an `id`.
///
/// A missing or `null` id is replaced by a generated one. Returns the id
/// together with the request serialized as a single line (no terminator).
pub fn prepare_request(mut request: Value) -> Result<(CallId, String), BridgeError> {
    let Value::Object(ref mut object) = request else {
        return Err(BridgeError::InvalidRequest(
            "request must be a JSON object".to_string(),
        ));
    };

    let id = match object.get("id") {
        None | Some(Value::Null) => {
            let id = CallId::generate();
            object.insert("id".to_string(), id.to_value());
            id
        }
        Some(value) => CallId::from_value(value).ok_or_else(|| {
            BridgeError::InvalidRequest(format!(
                "id must be a string or an integer, got {value}"
            ))
        })?,
    };

    // serde_json escapes control characters, so the output never spans lines.
    let line = serde_json::to_string(&request)?;
    Ok((id, line))
}

/// Readiness probe sent to a freshly spawned worker.
pub fn probe_request(id: &CallId, method: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.to_value(),
        "method": method,
    })
}
