use thiserror::Error;

/// Everything that can go wrong between a descriptor and a decoded tool
/// result.
///
/// Connection-phase faults (`Config`, `Connect`) are kept apart from
/// in-call faults (`Closed`, `Protocol`, `Application`, `Timeout`) so the
/// manager can skip a server that never came up while callers decide what to
/// do with a call that failed against a live one.
#[derive(Debug, Error)]
pub enum McpError {
    /// The descriptor is malformed: both or neither of command/url set, a bad
    /// name, a bad URL or header. Caught before any connection attempt.
    #[error("mcp server '{server}': invalid config: {reason}")]
    Config { server: String, reason: String },

    /// Spawning the child process or dialing the remote endpoint failed.
    #[error("mcp server '{server}': connect failed: {reason}")]
    Connect { server: String, reason: String },

    /// The transport died after connecting: the child exited, the socket
    /// dropped, or the session was closed.
    #[error("mcp server '{server}': connection closed: {reason}")]
    Closed { server: String, reason: String },

    /// An inbound payload or reply body could not be decoded.
    #[error("mcp server '{server}': protocol error: {reason}")]
    Protocol { server: String, reason: String },

    /// The peer answered with a JSON-RPC error object.
    #[error("mcp server '{server}' returned error {code}: {message}")]
    Application {
        server: String,
        code: i64,
        message: String,
    },

    /// No response arrived within the per-call deadline.
    #[error("mcp server '{server}': request timed out after {seconds}s")]
    Timeout { server: String, seconds: u64 },

    /// The namespaced tool name is malformed or names no ready server.
    #[error("unknown mcp tool '{name}'")]
    NotFound { name: String },
}
