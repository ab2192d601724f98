//! Bridge configuration loading and validation.
//!
//! Reads `bridge.yaml` and resolves environment variables. Every field has a
//! default, so an empty file (or no file at all) yields a usable config that
//! launches the Puppeteer worker with `npx tsx index.ts`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::worker_client::errors::BridgeError;

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "bridge.yaml";

/// Environment variable that points directly at a config file.
pub const CONFIG_ENV_VAR: &str = "BROWSER_BRIDGE_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// How the worker process is launched.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Display name used in logs and error messages.
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Directory the worker is started in. Relative paths resolve against
    /// the bridge's own working directory.
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "puppeteer".to_string(),
            command: default_npx_command().to_string(),
            args: vec!["tsx".to_string(), "index.ts".to_string()],
            working_dir: PathBuf::from("."),
            env: HashMap::new(),
        }
    }
}

/// Identity and protocol version announced during the handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "browser-bridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: "2025-03-26".to_string(),
        }
    }
}

/// Handshake, call, and shutdown timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handshake_ms: u64,
    /// Per-call limit. `None` lets a stalled worker block its caller
    /// indefinitely.
    pub call_ms: Option<u64>,
    /// How long to wait after closing stdin before sending SIGTERM.
    pub shutdown_grace_ms: u64,
    /// How long to wait after SIGTERM before sending SIGKILL.
    pub terminate_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_ms: 30_000,
            call_ms: None,
            shutdown_grace_ms: 5_000,
            terminate_grace_ms: 2_000,
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn call(&self) -> Option<Duration> {
        self.call_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Where and how logs are written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Log file path. When absent, logs go to stderr.
    pub file: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

/// Top-level bridge configuration (mirrors `bridge.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub worker: WorkerConfig,
    pub client: ClientConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Reject configurations that cannot launch or stop a worker.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.worker.command.trim().is_empty() {
            return Err(BridgeError::ConfigError {
                reason: "worker.command must not be empty".into(),
            });
        }
        if self.timeouts.shutdown_grace_ms == 0 || self.timeouts.terminate_grace_ms == 0 {
            return Err(BridgeError::ConfigError {
                reason: "shutdown grace periods must be greater than zero".into(),
            });
        }
        if self.timeouts.handshake_ms == 0 {
            return Err(BridgeError::ConfigError {
                reason: "timeouts.handshake_ms must be greater than zero".into(),
            });
        }
        if self.timeouts.call_ms == Some(0) {
            return Err(BridgeError::ConfigError {
                reason: "timeouts.call_ms must be greater than zero when set".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `BROWSER_BRIDGE_CONFIG`, then searches upward from `start` for
/// `bridge.yaml`, then the per-user config directory.
pub fn find_config_path(start: &Path) -> Result<PathBuf, BridgeError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not point at a file");
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    // 3. User config dir
    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("browser-bridge").join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(BridgeError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load, interpolate, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<BridgeConfig, BridgeError> {
    let raw = std::fs::read_to_string(path).map_err(|e| BridgeError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = parse_config(&raw)?;

    tracing::debug!(path = %path.display(), "loaded bridge config");
    Ok(config)
}

/// Parse config text. An empty document yields the defaults.
pub fn parse_config(raw: &str) -> Result<BridgeConfig, BridgeError> {
    let interpolated = interpolate_env_vars(raw);

    let config: BridgeConfig = if interpolated.trim().is_empty() {
        BridgeConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| BridgeError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?
    };

    config.validate()?;
    Ok(config)
}

// ─── Platform Helpers ────────────────────────────────────────────────────────

/// Platform-correct npx command (`npx` is a batch script on Windows).
fn default_npx_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "npx.cmd"
    } else {
        "npx"
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.worker.args, vec!["tsx", "index.ts"]);
        assert_eq!(config.client.protocol_version, "2025-03-26");
        assert_eq!(config.timeouts.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.timeouts.terminate_grace(), Duration::from_secs(2));
        assert!(config.timeouts.call().is_none());
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let yaml = r#"
            worker:
              command: node
              args: ["dist/index.js"]
              working_dir: /opt/puppeteer-worker
            timeouts:
              call_ms: 15000
            logging:
              format: json
        "#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.worker.command, "node");
        assert_eq!(config.worker.name, "puppeteer");
        assert_eq!(config.worker.working_dir, PathBuf::from("/opt/puppeteer-worker"));
        assert_eq!(config.timeouts.call(), Some(Duration::from_secs(15)));
        assert_eq!(config.timeouts.handshake_ms, 30_000);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let err = parse_config("worker:\n  command: \"  \"\n").unwrap_err();
        assert!(matches!(err, BridgeError::ConfigError { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_grace() {
        let err = parse_config("timeouts:\n  terminate_grace_ms: 0\n").unwrap_err();
        assert!(err.to_string().contains("grace"));
    }

    #[test]
    fn test_validate_rejects_zero_call_timeout() {
        assert!(parse_config("timeouts:\n  call_ms: 0\n").is_err());
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__BRIDGE_TEST_MISSING__");
        let result = interpolate_env_vars("${__BRIDGE_TEST_MISSING__:-/srv/worker}");
        assert_eq!(result, "/srv/worker");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__BRIDGE_TEST_DIR__", "/custom/worker");
        let config =
            parse_config("worker:\n  working_dir: ${__BRIDGE_TEST_DIR__:-/fallback}\n").unwrap();
        assert_eq!(config.worker.working_dir, PathBuf::from("/custom/worker"));
        std::env::remove_var("__BRIDGE_TEST_DIR__");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/worker");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/worker"));
    }

    #[test]
    fn test_find_config_path_walks_upward() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join(CONFIG_FILE_NAME), "worker:\n  command: node\n").unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, root.path().join(CONFIG_FILE_NAME));

        let config = load_config(&found).unwrap();
        assert_eq!(config.worker.command, "node");
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
