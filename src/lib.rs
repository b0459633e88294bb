//! Client for external MCP tool servers.
//!
//! Speaks JSON-RPC 2.0 to any number of independently configured servers over
//! three transports (spawned subprocess, WebSocket, HTTP request/response),
//! correlates responses to concurrently outstanding calls by request id, and
//! merges every server's tool catalog into one `mcp_{server}_{tool}`
//! namespace so a call can be routed back to its owner from the name alone.

// Module declarations
mod error;
mod manager;
mod session;
mod transport;
mod types;

pub use error::McpError;
pub use manager::McpManager;
pub use session::{McpSession, SessionState};
pub use types::{McpServerConfig, ToolDescriptor};
