//! Worker client error types.
//!
//! Transport failures and worker-reported failures are separate variants so
//! callers can branch on them without inspecting messages.

use thiserror::Error;

/// Errors that can occur while talking to the automation worker.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker executable could not be started.
    #[error("failed to spawn worker '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialize handshake failed or the worker closed during it.
    #[error("worker '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// Writing to the worker's stdin failed because the pipe is gone.
    #[error("worker '{name}' input pipe closed: {reason}")]
    PipeClosed { name: String, reason: String },

    /// The worker's stdout reached end-of-stream while a response was pending.
    #[error("worker '{name}' closed its output stream")]
    ConnectionClosed { name: String },

    /// A line read from the worker is not a well-formed JSON-RPC message.
    #[error("malformed message from worker: {reason}")]
    MalformedMessage { reason: String, line: String },

    /// The worker answered the request with a JSON-RPC error object.
    #[error("worker error [{code}]: {message}")]
    RemoteError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A call was attempted before the handshake completed or after stop.
    #[error("session is not initialized (state: {state})")]
    NotInitialized { state: String },

    /// The response id does not match the outstanding request.
    #[error("protocol desync: expected response id {expected}, received {received}")]
    ProtocolDesync { expected: u64, received: u64 },

    /// A call did not complete within the configured per-call timeout.
    #[error("call '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The session refused the call because an earlier failure left the
    /// pipe in an unknown state.
    #[error("session degraded: {reason}")]
    Degraded { reason: String },

    /// `start()` was called on a session that already left `Uninitialized`.
    #[error("session already started (state: {state})")]
    AlreadyStarted { state: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl BridgeError {
    /// Whether the failure came from the pipe or process rather than from
    /// the worker's own reply.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::PipeClosed { .. }
                | BridgeError::ConnectionClosed { .. }
                | BridgeError::MalformedMessage { .. }
                | BridgeError::ProtocolDesync { .. }
                | BridgeError::Timeout { .. }
        )
    }

    /// Whether the worker explicitly reported this error for the call.
    pub fn is_remote(&self) -> bool {
        matches!(self, BridgeError::RemoteError { .. })
    }

    /// Whether this failure leaves the session unable to serve more calls.
    pub(crate) fn degrades_session(&self) -> bool {
        matches!(
            self,
            BridgeError::PipeClosed { .. }
                | BridgeError::ConnectionClosed { .. }
                | BridgeError::ProtocolDesync { .. }
                | BridgeError::Timeout { .. }
        )
    }
}
