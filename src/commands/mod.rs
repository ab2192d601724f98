//! Commands exposed to the façade layer.
//!
//! Each command takes a `&Session` and returns a serializable response, so
//! an HTTP or IPC front end can forward results without interpreting
//! transport errors itself.

pub mod health;
pub mod tools;

pub use health::{health, HealthReport};
pub use tools::{call_tool, list_resources, list_tools, ResourcesResponse, ToolResponse, ToolsResponse};
