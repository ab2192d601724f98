//! Health reporting built on the session's readiness flag.

use serde::Serialize;

use crate::worker_client::{Session, SessionState};

/// Service name reported by the health check.
pub const SERVICE_NAME: &str = "browser-bridge";

/// Health snapshot for the façade's health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `"healthy"` while the bridge process is serving; the worker's own
    /// condition is reported separately.
    pub status: String,
    pub service: String,
    /// `"running"` when the session is ready, otherwise the session state.
    pub worker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Build a health report from the session's current state.
pub fn health(session: &Session) -> HealthReport {
    let state = session.state();
    let worker = match state {
        SessionState::Ready => "running".to_string(),
        other => other.to_string(),
    };
    let worker_server = session
        .server_info()
        .and_then(|init| init.server_info)
        .and_then(|info| match (info.name, info.version) {
            (Some(name), Some(version)) => Some(format!("{name} {version}")),
            (name, _) => name,
        });

    HealthReport {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        worker,
        worker_server,
        detail: session.degraded_reason(),
    }
}
