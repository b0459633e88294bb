use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::McpError;

pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration for one external MCP server.
///
/// Exactly one of `command` / `url` must be set. `command` spawns the server
/// as a child process speaking newline-delimited JSON over stdio; `url`
/// dials it over WebSocket (`ws://`, `wss://`) or plain HTTP request/response
/// (`http://`, `https://`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Server name, used for tool prefixing: mcp_{name}_{tool}.
    pub name: String,
    /// Command line to spawn the server (e.g. "npx excalidraw-mcp --stdio").
    #[serde(default)]
    pub command: Option<String>,
    /// Extra arguments appended to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to pass to the spawned server.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Remote endpoint for the socket or request/response transports.
    #[serde(default)]
    pub url: Option<String>,
    /// Headers sent when dialing `url`.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Timeout in seconds for each call (default: 30).
    #[serde(default, alias = "timeoutSeconds")]
    pub timeout_secs: Option<u64>,
}

impl McpServerConfig {
    /// Per-call deadline for this server.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Check the descriptor invariants. Run before any connection attempt;
    /// a violation here is a configuration mistake, not a runtime fault.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.name.is_empty() {
            return Err(self.config_error("server name cannot be empty"));
        }
        if !self.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
            return Err(self.config_error(
                "server name must be alphanumeric or hyphenated (underscores break tool routing)",
            ));
        }
        match (&self.command, &self.url) {
            (Some(_), Some(_)) => Err(self.config_error("both command and url are set")),
            (None, None) => Err(self.config_error("neither command nor url is set")),
            _ => Ok(()),
        }
    }

    pub(crate) fn config_error(&self, reason: &str) -> McpError {
        McpError::Config {
            server: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// A tool advertised by an MCP server via tools/list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Schema for the tool arguments, passed through unmodified.
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

// ── Tests ────────────────────────────────────────────────────────────────
