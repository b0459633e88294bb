use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::error::McpError;
use crate::session::McpSession;
use crate::types::{McpServerConfig, ToolDescriptor};

// === Manager ===
// Owns every ready session. Connection fan-out tolerates partial failure:
// a server that will not come up is logged and skipped, never fatal. Tools
// are exposed under mcp_{server}_{tool} so a call routes back to its owning
// session with no side lookup table.

/// Prefix distinguishing namespaced MCP tools from native tools.
const TOOL_PREFIX: &str = "mcp_";

/// Aggregates sessions across all configured servers and routes namespaced
/// tool calls to the right one.
///
/// The session map is populated by `connect_all` and drained by `close_all`;
/// there is no mid-life add or remove of individual servers.
pub struct McpManager {
    sessions: Mutex<HashMap<String, Arc<McpSession>>>,
}

impl McpManager {
    pub fn new() -> Self {
        McpManager {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<McpSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect and initialize every configured server, one worker thread per
    /// descriptor. A server that fails is logged and left out of the ready
    /// set; it never aborts the attempts for the others.
    pub fn connect_all(&self, configs: Vec<McpServerConfig>) {
        let (tx, rx) = mpsc::channel();
        for config in configs {
            let tx = tx.clone();
            thread::spawn(move || {
                let name = config.name.clone();
                let _ = tx.send((name, McpSession::connect(config)));
            });
        }
        drop(tx);

        for (name, outcome) in rx {
            match outcome {
                Ok(session) => {
                    let mut sessions = self.lock_sessions();
                    if sessions.contains_key(&name) {
                        drop(sessions);
                        eprintln!("[mcp] duplicate server name '{name}', keeping the first");
                        session.close();
                    } else {
                        eprintln!("[mcp] connected to '{name}'");
                        sessions.insert(name, Arc::new(session));
                    }
                }
                Err(err) => eprintln!("[mcp] skipping server '{name}': {err}"),
            }
        }
    }

    /// The merged tool catalog across every ready session, each tool renamed
    /// to mcp_{server}_{tool} so the owning server is recoverable from the
    /// name alone.
    pub fn get_tools(&self) -> Vec<ToolDescriptor> {
        let sessions = self.sessions_by_name();

        let mut tools = Vec::new();
        for session in sessions {
            match session.list_tools() {
                Ok(list) => {
                    for mut tool in list {
                        tool.name = format!("{TOOL_PREFIX}{}_{}", session.name(), tool.name);
                        tools.push(tool);
                    }
                }
                Err(err) => {
                    eprintln!("[mcp] tools/list failed for '{}': {err}", session.name());
                }
            }
        }
        tools
    }

    /// Route a namespaced tool call to its owning session.
    pub fn call_tool(
        &self,
        full_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let Some((server, tool)) = split_tool_name(full_name) else {
            return Err(McpError::NotFound {
                name: full_name.to_string(),
            });
        };
        let session = self.lock_sessions().get(server).cloned();
        let Some(session) = session else {
            return Err(McpError::NotFound {
                name: full_name.to_string(),
            });
        };
        session.call_tool(tool, arguments)
    }

    /// Look up a ready session by server name.
    pub fn session(&self, name: &str) -> Option<Arc<McpSession>> {
        self.lock_sessions().get(name).cloned()
    }

    /// Names of every ready session, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_sessions().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every session. Teardown problems are logged by the sessions
    /// themselves; shutdown always completes from the manager's side.
    pub fn close_all(&self) {
        let drained: Vec<Arc<McpSession>> = {
            let mut sessions = self.lock_sessions();
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            session.close();
        }
    }

    // Sessions snapshotted outside the map lock, in name order so the
    // catalog is stable. list_tools can block up to a full timeout; holding
    // the map lock across that would stall every concurrent router.
    fn sessions_by_name(&self) -> Vec<Arc<McpSession>> {
        let mut sessions: Vec<Arc<McpSession>> = self.lock_sessions().values().cloned().collect();
        sessions.sort_by(|a, b| a.name().cmp(b.name()));
        sessions
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `mcp_{server}_{tool}` back into its parts. Server names cannot
/// contain underscores (enforced at config validation), so the split at the
/// first underscore after the prefix is unambiguous.
fn split_tool_name(full_name: &str) -> Option<(&str, &str)> {
    let rest = full_name.strip_prefix(TOOL_PREFIX)?;
    let (server, tool) = rest.split_once('_')?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use serde_json::json;

    fn stdio_config(name: &str, script: &str) -> McpServerConfig {
        McpServerConfig {
            name: name.to_string(),
            command: Some("/bin/sh".to_string()),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            timeout_secs: Some(5),
        }
    }

    const RESPONDER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *initialize*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
    *tools/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"read","description":"read a file","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *tools/call*) printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id" ;;
  esac
done"#;

    #[test]
    fn test_split_tool_name() {
        assert_eq!(split_tool_name("mcp_alpha_search"), Some(("alpha", "search")));
        // Only the first separator after the prefix splits; the rest belongs
        // to the tool.
        assert_eq!(
            split_tool_name("mcp_alpha_search_files"),
            Some(("alpha", "search_files"))
        );
        assert_eq!(split_tool_name("search"), None);
        assert_eq!(split_tool_name("mcp_"), None);
        assert_eq!(split_tool_name("mcp_alpha"), None);
        assert_eq!(split_tool_name("mcp_alpha_"), None);
        assert_eq!(split_tool_name("mcp__search"), None);
    }

    #[test]
    fn test_connect_all_tolerates_partial_failure() {
        let manager = McpManager::new();
        let broken = McpServerConfig {
            command: Some("/nonexistent-mcp-server-binary".to_string()),
            ..stdio_config("broken", "")
        };
        manager.connect_all(vec![
            stdio_config("alpha", RESPONDER),
            broken,
            stdio_config("beta", RESPONDER),
        ]);

        assert_eq!(manager.server_names(), vec!["alpha", "beta"]);
        assert!(manager.session("alpha").is_some());
        assert!(manager.session("broken").is_none());

        // Catalog covers exactly the ready sessions, prefixed.
        let tools: Vec<String> = manager.get_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(tools, vec!["mcp_alpha_read", "mcp_beta_read"]);

        manager.close_all();
        assert!(manager.server_names().is_empty());
    }

    #[test]
    fn test_call_tool_routes_by_namespaced_name() {
        let manager = McpManager::new();
        manager.connect_all(vec![stdio_config("fs", RESPONDER)]);

        let tools: Vec<String> = manager.get_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(tools, vec!["mcp_fs_read"]);

        let result = manager
            .call_tool("mcp_fs_read", json!({"path": "/tmp/a"}))
            .unwrap();
        assert_eq!(result, json!({"ok": true}));

        // Missing prefix and unknown server both fail the lookup.
        let err = manager.call_tool("read", json!({})).unwrap_err();
        assert!(matches!(err, McpError::NotFound { .. }), "got {err:?}");
        let err = manager.call_tool("mcp_nope_read", json!({})).unwrap_err();
        assert!(matches!(err, McpError::NotFound { .. }), "got {err:?}");

        manager.close_all();

        // After shutdown the ready set is empty; routing fails cleanly.
        let err = manager.call_tool("mcp_fs_read", json!({})).unwrap_err();
        assert!(matches!(err, McpError::NotFound { .. }), "got {err:?}");
    }
}
