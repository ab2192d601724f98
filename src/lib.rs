//! Browser Bridge — synchronous request/response access to a browser
//! automation worker that speaks line-delimited JSON-RPC over stdio.
//!
//! The host application constructs one [`Session`], starts it at startup,
//! hands `&Session` (or an `Arc`) to its request handlers, and stops it at
//! shutdown. There is no global client.

pub mod commands;
pub mod config;
pub mod logging;
pub mod worker_client;

pub use config::BridgeConfig;
pub use worker_client::{BridgeError, Session, SessionState, ToolResult};
