use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Deserialize;
use serde_json::json;

use crate::error::McpError;
use crate::transport::Transport;
use crate::types::{McpServerConfig, ToolDescriptor};

// === Per-server session ===
// One session per configured server: it owns the transport exclusively and
// wraps it in the JSON-RPC envelope logic — id allocation, pending-request
// bookkeeping, response dispatch, the initialize handshake and the typed
// tool operations.

/// Session lifecycle. A failure while connecting or initializing is terminal;
/// there is no reconnection path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Initializing,
    Ready,
    Closed,
}

/// One registered caller parked on the response bearing its id.
struct PendingRequest {
    slot: mpsc::SyncSender<serde_json::Value>,
    created: Instant,
}

/// The id counter, the pending table and the lifecycle state share one lock,
/// keeping id allocation, response dispatch and timeout eviction mutually
/// atomic.
pub(crate) struct SharedState {
    next_id: i64,
    pending: HashMap<i64, PendingRequest>,
    state: SessionState,
}

impl SharedState {
    fn new() -> Self {
        SharedState {
            next_id: 0,
            pending: HashMap::new(),
            state: SessionState::Unconnected,
        }
    }
}

fn lock(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Route one decoded inbound payload to the caller whose id it bears.
///
/// Entry removal and slot delivery happen under the session lock, so they are
/// atomic with respect to timeout eviction: whichever side takes the entry
/// first wins and the loser is a no-op. Payloads without a matching pending
/// id are dropped; this client carries no support for server-initiated
/// traffic.
pub(crate) fn dispatch(shared: &Mutex<SharedState>, server: &str, payload: serde_json::Value) {
    let Some(id) = payload.get("id").and_then(serde_json::Value::as_i64) else {
        let method = payload
            .get("method")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("?");
        eprintln!("[mcp:{server}] dropping frame without request id (method: {method})");
        return;
    };
    let mut shared = lock(shared);
    match shared.pending.remove(&id) {
        // Capacity-1 slot carrying its only message: the send cannot block.
        // A receiver that already gave up makes this a no-op.
        Some(entry) => {
            let _ = entry.slot.send(payload);
        }
        None => eprintln!("[mcp:{server}] dropping response for unknown id {id}"),
    }
}

/// Mark the session closed and fail every pending caller. Runs on explicit
/// close and when a transport reader sees its connection die.
pub(crate) fn evict_all(shared: &Mutex<SharedState>, server: &str, reason: &str) {
    let mut shared = lock(shared);
    if shared.state == SessionState::Closed && shared.pending.is_empty() {
        return;
    }
    shared.state = SessionState::Closed;
    if !shared.pending.is_empty() {
        eprintln!(
            "[mcp:{server}] failing {} pending request(s): {reason}",
            shared.pending.len()
        );
    }
    // Dropping the slots disconnects their receivers, failing the callers.
    shared.pending.clear();
}

/// Split a reply envelope into its result or its error object.
fn decode_reply(server: &str, envelope: serde_json::Value) -> Result<serde_json::Value, McpError> {
    #[derive(Deserialize)]
    struct RpcErrorBody {
        #[serde(default)]
        code: i64,
        #[serde(default)]
        message: String,
    }

    if let Some(error) = envelope.get("error") {
        if !error.is_null() {
            let body: RpcErrorBody =
                serde_json::from_value(error.clone()).map_err(|e| McpError::Protocol {
                    server: server.to_string(),
                    reason: format!("malformed error object: {e}"),
                })?;
            return Err(McpError::Application {
                server: server.to_string(),
                code: body.code,
                message: body.message,
            });
        }
    }
    match envelope.get("result") {
        Some(result) => Ok(result.clone()),
        None => Err(McpError::Protocol {
            server: server.to_string(),
            reason: "reply carries neither result nor error".to_string(),
        }),
    }
}

/// A live channel to one MCP server.
pub struct McpSession {
    config: McpServerConfig,
    transport: Transport,
    shared: Arc<Mutex<SharedState>>,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl McpSession {
    /// Connect to the server described by `config` and run the initialize
    /// handshake. On any failure the transport is torn down and the session
    /// is unusable; callers should drop it.
    pub fn connect(config: McpServerConfig) -> Result<Self, McpError> {
        config.validate()?;

        let shared = Arc::new(Mutex::new(SharedState::new()));
        lock(&shared).state = SessionState::Connecting;

        let transport = match Transport::connect(&config, Arc::clone(&shared)) {
            Ok(transport) => transport,
            Err(err) => {
                lock(&shared).state = SessionState::Closed;
                return Err(err);
            }
        };
        lock(&shared).state = SessionState::Initializing;

        let session = McpSession {
            config,
            transport,
            shared,
        };
        if let Err(err) = session.initialize() {
            session.close();
            return Err(err);
        }
        {
            // The transport may already have died between the handshake reply
            // and here; Closed stays Closed.
            let mut shared = lock(&session.shared);
            if shared.state == SessionState::Initializing {
                shared.state = SessionState::Ready;
            }
        }
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    fn initialize(&self) -> Result<(), McpError> {
        self.request("initialize", json!({"capabilities": {}}))
            .map(|_| ())
    }

    /// List the tools this server advertises, under their original names.
    pub fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        #[derive(Deserialize)]
        struct ToolsResult {
            #[serde(default)]
            tools: Vec<ToolDescriptor>,
        }

        let result = self.request("tools/list", json!({}))?;
        let decoded: ToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol {
                server: self.config.name.clone(),
                reason: format!("undecodable tools/list result: {e}"),
            })?;
        Ok(decoded.tools)
    }

    /// Invoke `name` with `arguments` and return the raw decoded result.
    pub fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.request("tools/call", json!({"name": name, "arguments": arguments}))
    }

    /// Issue one JSON-RPC request and wait for its reply.
    ///
    /// Streaming transports go through the pending table: allocate the id and
    /// register the slot under the session lock, hand the encoded request to
    /// the transport, then park on the private slot until the dispatch thread
    /// delivers the matching response or the deadline elapses. The
    /// request/response transport performs its single round trip inline
    /// instead — it has no inbound stream to correlate against.
    fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        if let Transport::Http(http) = &self.transport {
            let id = {
                let mut shared = lock(&self.shared);
                if shared.state == SessionState::Closed {
                    return Err(self.closed_error());
                }
                shared.next_id += 1;
                shared.next_id
            };
            let envelope = http.round_trip(&json!({
                "jsonrpc": "2.0", "id": id, "method": method, "params": params,
            }))?;
            return decode_reply(&self.config.name, envelope);
        }

        let (id, receiver) = {
            let mut shared = lock(&self.shared);
            if shared.state == SessionState::Closed {
                return Err(self.closed_error());
            }
            shared.next_id += 1;
            let id = shared.next_id;
            let (slot, receiver) = mpsc::sync_channel(1);
            shared.pending.insert(
                id,
                PendingRequest {
                    slot,
                    created: Instant::now(),
                },
            );
            (id, receiver)
        };

        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(err) = self.transport.send(&request) {
            lock(&self.shared).pending.remove(&id);
            return Err(err);
        }

        match receiver.recv_timeout(self.config.call_timeout()) {
            Ok(envelope) => decode_reply(&self.config.name, envelope),
            Err(RecvTimeoutError::Timeout) => {
                let evicted = lock(&self.shared).pending.remove(&id);
                match evicted {
                    Some(entry) => {
                        eprintln!(
                            "[mcp:{}] request {id} ({method}) timed out after {:?}",
                            self.config.name,
                            entry.created.elapsed()
                        );
                        Err(McpError::Timeout {
                            server: self.config.name.clone(),
                            seconds: self.config.call_timeout().as_secs(),
                        })
                    }
                    // The dispatcher took the entry between our deadline and
                    // the lock; the response is already sitting in the slot.
                    None => match receiver.try_recv() {
                        Ok(envelope) => decode_reply(&self.config.name, envelope),
                        Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                            Err(self.closed_error())
                        }
                    },
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> McpError {
        McpError::Closed {
            server: self.config.name.clone(),
            reason: "session is closed".to_string(),
        }
    }

    /// Tear the session down: fail every still-pending caller, then close the
    /// transport (stdin EOF then kill for a child process, close frame for a
    /// socket, nothing for request/response).
    pub fn close(&self) {
        evict_all(&self.shared, &self.config.name, "session closed");
        self.transport.close();
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
