//! Worker client: JSON-RPC over stdio to the browser-automation worker.
//!
//! This module handles:
//! - Spawning the worker process and supervising its shutdown
//! - Line-delimited JSON-RPC 2.0 encoding and decoding
//! - Draining the worker's stderr into the log
//! - The `initialize` handshake and serialized request/response correlation
//!
//! The façade layer only sees [`Session`]: `start`, `stop`, `invoke`,
//! `call_tool`, `list_tools`, `list_resources`, and `is_ready`.

pub mod codec;
pub mod errors;
pub mod monitor;
pub mod process;
pub mod session;
pub mod types;

// Re-exports for convenience
pub use errors::BridgeError;
pub use session::{Session, SessionState};
pub use types::{ResourceDescriptor, ToolDescriptor, ToolResult};
