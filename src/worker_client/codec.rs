//! Line-delimited JSON-RPC codec.
//!
//! One JSON object per line. `serde_json` escapes control characters inside
//! strings, so an encoded message never contains a raw newline before its
//! terminator.

use serde::Serialize;
use serde_json::Value;

use super::errors::BridgeError;
use super::types::{InboundMessage, JsonRpcError, JsonRpcResponse};

/// Serialize an outbound message to a single `\n`-terminated line.
pub fn encode<T: Serialize>(message: &T) -> Result<String, BridgeError> {
    let mut line = serde_json::to_string(message).map_err(|e| BridgeError::MalformedMessage {
        reason: format!("failed to serialize message: {e}"),
        line: String::new(),
    })?;
    line.push('\n');
    Ok(line)
}

/// Parse one line read from the worker.
///
/// The line must hold a JSON object that is a response (`id` plus `result`
/// or `error`), a notification (`method`, no `id`), or a request from the
/// worker (`method` and `id`).
pub fn decode(line: &str) -> Result<InboundMessage, BridgeError> {
    let trimmed = line.trim();
    let malformed = |reason: String| BridgeError::MalformedMessage {
        reason,
        line: truncate_line(trimmed),
    };

    let value: Value = serde_json::from_str(trimmed).map_err(|e| malformed(format!("{e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(malformed("expected a JSON object".into()));
    };

    if let Some(method) = obj.remove("method") {
        let method = method
            .as_str()
            .ok_or_else(|| malformed("'method' must be a string".into()))?
            .to_string();
        let params = obj.remove("params");
        return Ok(match obj.remove("id") {
            Some(id) if !id.is_null() => InboundMessage::Request { id, method, params },
            _ => InboundMessage::Notification { method, params },
        });
    }

    let id = match obj.remove("id") {
        None => return Err(malformed("message has neither 'id' nor 'method'".into())),
        Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(
            n.as_u64()
                .ok_or_else(|| malformed(format!("unsupported response id {n}")))?,
        ),
        Some(Value::String(s)) => Some(
            s.parse::<u64>()
                .map_err(|_| malformed(format!("unsupported response id \"{s}\"")))?,
        ),
        Some(other) => return Err(malformed(format!("unsupported response id {other}"))),
    };

    let error = match obj.remove("error") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<JsonRpcError>(raw)
                .map_err(|e| malformed(format!("invalid error object: {e}")))?,
        ),
    };
    let result = obj.remove("result");

    if result.is_none() && error.is_none() {
        return Err(malformed("response carries neither 'result' nor 'error'".into()));
    }

    Ok(InboundMessage::Response(JsonRpcResponse { id, result, error }))
}

/// Keep offending lines short enough to log.
fn truncate_line(line: &str) -> String {
    const MAX: usize = 200;
    if line.len() <= MAX {
        return line.to_string();
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}
