//! Worker session — handshake, request correlation, and shutdown.
//!
//! A `Session` owns exactly one worker. All calls go through a single
//! `tokio::sync::Mutex` around the request pipe, so at most one round trip
//! is in flight and queued callers are served in arrival order. Each
//! response must carry the id of the request just written. Responses with a
//! lower id belong to calls that were cancelled or failed before their answer
//! arrived and are discarded; a higher id is a protocol desync.
//!
//! ```text
//! Uninitialized ──start──▶ Initializing ──handshake ok──▶ Ready
//!                               │                          │
//!                               └──failure──▶ Stopped ◀──stop──┤
//!                                                 ▲        transport failure
//!                                                 └──stop── Degraded ◀┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;

use super::codec;
use super::errors::BridgeError;
use super::monitor::{self, DiagnosticTail};
use super::process::{self, WorkerProcess, WorkerStdio};
use super::types::{
    error_codes, ClientInfo, InboundMessage, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcReply, JsonRpcRequest, JsonRpcResponse, ResourceDescriptor, ToolDescriptor, ToolResult,
};
use crate::config::BridgeConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long a failed start waits for the stderr monitor to catch the
/// worker's last words.
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// How long `stop()` waits for the stderr monitor after the worker exits.
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    /// A transport failure or timeout left the pipe unusable. Calls fail
    /// fast until the session is stopped.
    Degraded,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    degraded_reason: Option<String>,
    server: Option<InitializeResult>,
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One worker process and the protocol state around it.
///
/// Every method takes `&self`; share the session between request handlers
/// with an `Arc`.
pub struct Session {
    config: BridgeConfig,
    status: Mutex<Status>,
    next_id: AtomicU64,
    /// Serialization gate. `None` before start and after stop.
    gate: tokio::sync::Mutex<Option<WorkerStdio>>,
    process: tokio::sync::Mutex<Option<WorkerProcess>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    diagnostics: DiagnosticTail,
}

impl Session {
    /// Create an unstarted session. No process is spawned until [`start`].
    ///
    /// [`start`]: Session::start
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            status: Mutex::new(Status {
                state: SessionState::Uninitialized,
                degraded_reason: None,
                server: None,
            }),
            next_id: AtomicU64::new(1),
            gate: tokio::sync::Mutex::new(None),
            process: tokio::sync::Mutex::new(None),
            monitor: Mutex::new(None),
            diagnostics: DiagnosticTail::default(),
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Readiness flag for health reporting.
    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Why the session was degraded, if it was.
    pub fn degraded_reason(&self) -> Option<String> {
        self.status().degraded_reason.clone()
    }

    /// The worker's `initialize` result, once the handshake succeeded.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.status().server.clone()
    }

    /// Recent worker stderr lines.
    pub fn recent_diagnostics(&self) -> Vec<String> {
        self.diagnostics.snapshot()
    }

    fn check_ready(&self) -> Result<(), BridgeError> {
        let status = self.status();
        match status.state {
            SessionState::Ready => Ok(()),
            SessionState::Degraded => Err(BridgeError::Degraded {
                reason: status
                    .degraded_reason
                    .clone()
                    .unwrap_or_else(|| "unknown failure".into()),
            }),
            state => Err(BridgeError::NotInitialized {
                state: state.to_string(),
            }),
        }
    }

    fn degrade(&self, reason: String) {
        let mut status = self.status();
        if status.state == SessionState::Ready {
            tracing::warn!(worker = %self.config.worker.name, %reason, "session degraded");
            status.state = SessionState::Degraded;
            status.degraded_reason = Some(reason);
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the worker, start the stderr monitor, and run the handshake.
    ///
    /// Any failure stops the session for good; it is not retried.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.begin_start()?;

        let spawned = match process::spawn(&self.config.worker) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(worker = %self.config.worker.name, error = %e, "failed to start worker");
                self.status().state = SessionState::Stopped;
                return Err(e);
            }
        };

        if let Some(stderr) = spawned.stderr {
            let handle =
                monitor::spawn_monitor(&self.config.worker.name, stderr, self.diagnostics.clone());
            *self.monitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
        *self.process.lock().await = Some(spawned.process);

        self.finish_start(spawned.stdio).await
    }

    /// Run the handshake over an already-connected pipe pair.
    ///
    /// The session owns no process in this mode; `stop()` only closes the
    /// pipes.
    pub async fn start_with_stdio(&self, stdio: WorkerStdio) -> Result<(), BridgeError> {
        self.begin_start()?;
        self.finish_start(stdio).await
    }

    fn begin_start(&self) -> Result<(), BridgeError> {
        let mut status = self.status();
        if status.state != SessionState::Uninitialized {
            return Err(BridgeError::AlreadyStarted {
                state: status.state.to_string(),
            });
        }
        status.state = SessionState::Initializing;
        Ok(())
    }

    async fn finish_start(&self, stdio: WorkerStdio) -> Result<(), BridgeError> {
        let name = self.config.worker.name.clone();
        *self.gate.lock().await = Some(stdio);

        let limit = self.config.timeouts.handshake();
        let outcome = match tokio::time::timeout(limit, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                method: "initialize".into(),
                timeout_ms: limit.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(init) => {
                let ready = {
                    let mut status = self.status();
                    if status.state != SessionState::Initializing {
                        false
                    } else {
                        tracing::info!(
                            worker = %name,
                            protocol = ?init.protocol_version,
                            server = ?init.server_info.as_ref().and_then(|s| s.name.clone()),
                            "worker session ready"
                        );
                        status.server = Some(init);
                        status.state = SessionState::Ready;
                        true
                    }
                };
                if !ready {
                    // stop() won the race and may have missed the process
                    self.abort_start().await;
                    return Err(BridgeError::HandshakeFailed {
                        name,
                        reason: "session stopped during handshake".into(),
                    });
                }
                Ok(())
            }
            Err(e) => {
                self.abort_start().await;
                let stderr = self.diagnostics.summary();
                let reason = if stderr.is_empty() {
                    e.to_string()
                } else {
                    format!("{e} | stderr: {stderr}")
                };
                tracing::error!(worker = %name, %reason, "worker handshake failed");
                Err(BridgeError::HandshakeFailed { name, reason })
            }
        }
    }

    /// Tear down after a failed handshake: no grace periods, the worker is
    /// already misbehaving.
    async fn abort_start(&self) {
        self.status().state = SessionState::Stopped;
        let stdio = self.gate.lock().await.take();
        drop(stdio);
        if let Some(mut process) = self.process.lock().await.take() {
            process.kill().await;
        }
        let handle = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(STDERR_SETTLE, handle).await;
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, BridgeError> {
        let client_info = ClientInfo {
            name: self.config.client.name.clone(),
            version: self.config.client.version.clone(),
        };
        let params = serde_json::json!({
            "protocolVersion": self.config.client.protocol_version,
            "capabilities": { "tools": {} },
            "clientInfo": client_info,
        });

        let mut gate = self.gate.lock().await;
        let stdio = gate.as_mut().ok_or_else(|| BridgeError::NotInitialized {
            state: SessionState::Stopped.to_string(),
        })?;

        let result = self.exchange(stdio, "initialize", Some(params)).await?;
        tracing::debug!(worker = %self.config.worker.name, %result, "initialize response");

        let init = if result.is_null() {
            InitializeResult::default()
        } else {
            serde_json::from_value::<InitializeResult>(result).map_err(|e| {
                BridgeError::MalformedMessage {
                    reason: format!("failed to parse initialize result: {e}"),
                    line: String::new(),
                }
            })?
        };

        let notification = JsonRpcNotification::new("notifications/initialized", None);
        stdio.write_line(&codec::encode(&notification)?).await?;

        Ok(init)
    }

    /// Stop the worker. Idempotent, never fails, and bounded by the two
    /// configured grace periods plus the final kill.
    ///
    /// If a call is stuck holding the pipe, stop does not wait for it beyond
    /// the first grace period; signalling the worker closes its stdout and
    /// the stuck call fails with `ConnectionClosed`.
    pub async fn stop(&self) {
        let previous = {
            let mut status = self.status();
            std::mem::replace(&mut status.state, SessionState::Stopped)
        };
        let name = &self.config.worker.name;
        let grace = self.config.timeouts.shutdown_grace();
        let secondary = self.config.timeouts.terminate_grace();
        let started = Instant::now();

        let process = self.process.lock().await.take();
        let stdio = match tokio::time::timeout(grace, self.gate.lock()).await {
            Ok(mut gate) => gate.take(),
            Err(_) => {
                tracing::warn!(worker = %name, "call still in flight, signalling worker without closing stdin");
                None
            }
        };

        if process.is_none() && stdio.is_none() && previous == SessionState::Stopped {
            tracing::debug!(worker = %name, "session already stopped");
            return;
        }

        tracing::info!(worker = %name, state = %previous, "stopping worker session");

        match process {
            Some(mut process) => {
                let remaining = grace.saturating_sub(started.elapsed());
                let status = process.terminate(stdio, remaining, secondary).await;
                tracing::info!(worker = %name, ?status, "worker stopped");
            }
            None => {
                if let Some(mut stdio) = stdio {
                    stdio.close_input().await;
                }
            }
        }

        let handle = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(MONITOR_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::debug!(worker = %name, "stderr still open after exit, abandoning monitor");
                abort.abort();
            }
        }
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Send `method` with `params` and return the worker's `result`.
    ///
    /// Fails with `NotInitialized` before the handshake or after stop,
    /// without touching the pipe.
    pub async fn invoke(&self, method: &str, params: Option<Value>) -> Result<Value, BridgeError> {
        self.check_ready()?;

        let mut gate = self.gate.lock().await;
        // State may have changed while queued behind the gate.
        self.check_ready()?;
        let stdio = gate.as_mut().ok_or_else(|| BridgeError::NotInitialized {
            state: self.state().to_string(),
        })?;

        let outcome = match self.config.timeouts.call() {
            Some(limit) => match tokio::time::timeout(limit, self.exchange(stdio, method, params))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(BridgeError::Timeout {
                    method: method.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => self.exchange(stdio, method, params).await,
        };
        drop(gate);

        if let Err(e) = &outcome {
            if e.degrades_session() {
                self.degrade(e.to_string());
            }
            tracing::warn!(worker = %self.config.worker.name, method, error = %e, "call failed");
        }
        outcome
    }

    /// Invoke a tool via `tools/call` and parse the result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, BridgeError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self.invoke("tools/call", Some(params)).await?;
        serde_json::from_value(result).map_err(|e| BridgeError::MalformedMessage {
            reason: format!("invalid tool result for '{name}': {e}"),
            line: String::new(),
        })
    }

    /// List the worker's tools. Errors propagate.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError> {
        let result = self.invoke("tools/list", None).await?;
        parse_listing(result, "tools")
    }

    /// List the worker's resources. Best-effort: any failure yields an
    /// empty list.
    pub async fn list_resources(&self) -> Vec<ResourceDescriptor> {
        let listing = match self.invoke("resources/list", None).await {
            Ok(result) => parse_listing(result, "resources"),
            Err(e) => Err(e),
        };
        listing.unwrap_or_else(|e| {
            tracing::warn!(worker = %self.config.worker.name, error = %e, "failed to list resources");
            Vec::new()
        })
    }

    // ─── Round Trip ──────────────────────────────────────────────────────

    /// Write one request and read until its response. Caller holds the gate.
    async fn exchange(
        &self,
        stdio: &mut WorkerStdio,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let line = codec::encode(&request)?;

        tracing::debug!(worker = %self.config.worker.name, id, method, "sending request");
        stdio.write_line(&line).await?;

        loop {
            let Some(line) = stdio.read_line().await? else {
                return Err(BridgeError::ConnectionClosed {
                    name: self.config.worker.name.clone(),
                });
            };
            if line.trim().is_empty() {
                continue;
            }

            match codec::decode(&line)? {
                InboundMessage::Response(response) => {
                    // Ids only grow and one request is in flight, so a lower id
                    // is the answer to an abandoned or failed earlier call.
                    if let Some(stale) = response.id.filter(|received| *received < id) {
                        tracing::warn!(
                            worker = %self.config.worker.name,
                            expected = id,
                            received = stale,
                            "discarding stale response"
                        );
                        continue;
                    }
                    tracing::debug!(worker = %self.config.worker.name, id, method, "received response");
                    return correlate(id, response);
                }
                InboundMessage::Notification { method: note, .. } => {
                    tracing::debug!(worker = %self.config.worker.name, method = %note, "worker notification");
                }
                InboundMessage::Request {
                    id: request_id,
                    method: asked,
                    ..
                } => {
                    self.answer_worker_request(stdio, request_id, &asked).await?;
                }
            }
        }
    }

    /// Reply to a request the worker sent us while we wait for a response.
    async fn answer_worker_request(
        &self,
        stdio: &mut WorkerStdio,
        id: Value,
        method: &str,
    ) -> Result<(), BridgeError> {
        let reply = if method == "ping" {
            JsonRpcReply {
                jsonrpc: "2.0".into(),
                id,
                result: Some(serde_json::json!({})),
                error: None,
            }
        } else {
            tracing::debug!(worker = %self.config.worker.name, method, "rejecting worker request");
            JsonRpcReply {
                jsonrpc: "2.0".into(),
                id,
                result: None,
                error: Some(JsonRpcError {
                    code: error_codes::METHOD_NOT_FOUND,
                    message: format!("method '{method}' not supported by client"),
                    data: None,
                }),
            }
        };
        stdio.write_line(&codec::encode(&reply)?).await
    }
}

/// Match a response to the outstanding request id and unwrap it.
fn correlate(expected: u64, response: JsonRpcResponse) -> Result<Value, BridgeError> {
    match response.id {
        Some(received) if received != expected => {
            return Err(BridgeError::ProtocolDesync { expected, received });
        }
        None if response.error.is_none() => {
            return Err(BridgeError::MalformedMessage {
                reason: "response with null id carries a result".into(),
                line: String::new(),
            });
        }
        _ => {}
    }

    if let Some(err) = response.error {
        return Err(BridgeError::RemoteError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    Ok(response.result.unwrap_or(Value::Null))
}

/// Pull `result[key]` out as a typed list. A missing key is an empty list.
fn parse_listing<T: serde::de::DeserializeOwned>(
    mut result: Value,
    key: &str,
) -> Result<Vec<T>, BridgeError> {
    match result.get_mut(key).map(Value::take) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(items) => serde_json::from_value(items).map_err(|e| BridgeError::MalformedMessage {
            reason: format!("invalid '{key}' listing: {e}"),
            line: String::new(),
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
