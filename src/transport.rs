use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tungstenite::client::IntoClientRequest;
use tungstenite::http::{HeaderName, HeaderValue};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use crate::error::McpError;
use crate::session::{self, SharedState};
use crate::types::McpServerConfig;

// === Transports ===
// Three ways to reach a server behind one contract: hand it an encoded JSON
// document, and (for the streaming variants) feed every inbound document to
// the session's dispatch routine from a background thread. The variant is
// picked once at connect time from whichever descriptor field is populated.

/// Poll interval for the socket thread; bounds the latency between a caller
/// queueing an outbound frame and the frame hitting the wire.
const SOCKET_POLL: Duration = Duration::from_millis(50);

/// How long process close waits for the child to exit after stdin EOF before
/// killing it.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

pub(crate) enum Transport {
    Process(ProcessTransport),
    Socket(SocketTransport),
    Http(HttpTransport),
}

impl Transport {
    /// Open the transport the descriptor asks for: a `command` spawns a
    /// child process, a `url` dials WebSocket or HTTP depending on scheme.
    pub(crate) fn connect(
        config: &McpServerConfig,
        shared: Arc<Mutex<SharedState>>,
    ) -> Result<Self, McpError> {
        if let Some(command) = config.command.as_deref() {
            return Ok(Transport::Process(ProcessTransport::spawn(
                config, command, shared,
            )?));
        }
        let Some(raw_url) = config.url.as_deref() else {
            return Err(config.config_error("neither command nor url is set"));
        };
        let parsed = Url::parse(raw_url)
            .map_err(|e| config.config_error(&format!("bad url '{raw_url}': {e}")))?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(Transport::Socket(SocketTransport::dial(
                config, raw_url, shared,
            )?)),
            "http" | "https" => Ok(Transport::Http(HttpTransport::new(config, raw_url))),
            other => Err(config.config_error(&format!("unsupported url scheme '{other}'"))),
        }
    }

    /// Hand one encoded JSON document to the peer. Only meaningful for the
    /// streaming variants; the request/response transport resolves its
    /// callers in `round_trip`.
    pub(crate) fn send(&self, payload: &serde_json::Value) -> Result<(), McpError> {
        match self {
            Transport::Process(process) => process.send(payload),
            Transport::Socket(socket) => socket.send(payload),
            Transport::Http(http) => Err(McpError::Protocol {
                server: http.server.clone(),
                reason: "request/response transport has no streaming channel".to_string(),
            }),
        }
    }

    /// Best-effort teardown; errors are logged, never returned.
    pub(crate) fn close(&self) {
        match self {
            Transport::Process(process) => process.close(),
            Transport::Socket(socket) => socket.close(),
            Transport::Http(_) => {}
        }
    }
}

// ── Process: child process over stdio ────────────────────────────────────

pub(crate) struct ProcessTransport {
    server: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
}

impl ProcessTransport {
    fn spawn(
        config: &McpServerConfig,
        command: &str,
        shared: Arc<Mutex<SharedState>>,
    ) -> Result<Self, McpError> {
        let server = config.name.clone();

        let mut argv = shlex::split(command)
            .ok_or_else(|| config.config_error("malformed command"))?;
        if argv.is_empty() {
            return Err(config.config_error("empty command"));
        }
        argv.extend(config.args.iter().cloned());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::Connect {
            server: server.clone(),
            reason: format!("spawn: {e}"),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| McpError::Connect {
            server: server.clone(),
            reason: "no stdin pipe".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Connect {
            server: server.clone(),
            reason: "no stdout pipe".to_string(),
        })?;

        // Drain stderr so the child cannot block on a full pipe; its lines go
        // to our log under the server tag.
        if let Some(stderr) = child.stderr.take() {
            let name = server.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    eprintln!("[mcp:{name}:stderr] {line}");
                }
            });
        }

        // Reader thread: one newline-delimited JSON document per line. When
        // the child exits or the pipe breaks, everyone still waiting is
        // failed so later calls error out instead of hanging.
        let name = server.clone();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        eprintln!("[mcp:{name}] stdout read error: {err}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(payload) => session::dispatch(&shared, &name, payload),
                    Err(err) => eprintln!("[mcp:{name}] dropping undecodable frame: {err}"),
                }
            }
            session::evict_all(&shared, &name, "server process exited");
        });

        Ok(ProcessTransport {
            server,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(child),
        })
    }

    fn send(&self, payload: &serde_json::Value) -> Result<(), McpError> {
        let mut body = serde_json::to_string(payload).map_err(|e| McpError::Protocol {
            server: self.server.clone(),
            reason: format!("encode: {e}"),
        })?;
        body.push('\n');

        let mut guard = self.stdin.lock().unwrap_or_else(|e| e.into_inner());
        let Some(stdin) = guard.as_mut() else {
            return Err(McpError::Closed {
                server: self.server.clone(),
                reason: "stdin already closed".to_string(),
            });
        };
        stdin
            .write_all(body.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|e| McpError::Closed {
                server: self.server.clone(),
                reason: format!("write: {e}"),
            })
    }

    fn close(&self) {
        // Dropping stdin delivers EOF, the conventional stop signal for a
        // stdio server. Give it a moment, then kill.
        drop(self.stdin.lock().unwrap_or_else(|e| e.into_inner()).take());

        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + CLOSE_GRACE;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
        if let Err(err) = child.kill() {
            eprintln!("[mcp:{}] kill failed: {err}", self.server);
        }
        let _ = child.wait();
    }
}

// ── Socket: persistent WebSocket ─────────────────────────────────────────

enum Outbound {
    Frame(String),
    Shutdown,
}

pub(crate) struct SocketTransport {
    server: String,
    outbound: mpsc::Sender<Outbound>,
}

impl SocketTransport {
    fn dial(
        config: &McpServerConfig,
        url: &str,
        shared: Arc<Mutex<SharedState>>,
    ) -> Result<Self, McpError> {
        let server = config.name.clone();

        let mut request = url.into_client_request().map_err(|e| McpError::Connect {
            server: server.clone(),
            reason: format!("bad request: {e}"),
        })?;
        for (key, value) in &config.headers {
            let header_name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| config.config_error(&format!("bad header name '{key}': {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| config.config_error(&format!("bad header value for '{key}': {e}")))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (mut socket, _response) =
            tungstenite::connect(request).map_err(|e| McpError::Connect {
                server: server.clone(),
                reason: format!("dial: {e}"),
            })?;

        // The socket thread owns the connection; a short read timeout lets it
        // interleave outbound writes with blocking reads.
        let timeout_result = match socket.get_mut() {
            MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(SOCKET_POLL)),
            MaybeTlsStream::Rustls(tls) => tls.sock.set_read_timeout(Some(SOCKET_POLL)),
            _ => Ok(()),
        };
        timeout_result.map_err(|e| McpError::Connect {
            server: server.clone(),
            reason: format!("set read timeout: {e}"),
        })?;

        let (outbound_tx, outbound_rx) = mpsc::channel();
        let name = server.clone();
        thread::spawn(move || socket_loop(socket, outbound_rx, shared, name));

        Ok(SocketTransport {
            server,
            outbound: outbound_tx,
        })
    }

    fn send(&self, payload: &serde_json::Value) -> Result<(), McpError> {
        let body = serde_json::to_string(payload).map_err(|e| McpError::Protocol {
            server: self.server.clone(),
            reason: format!("encode: {e}"),
        })?;
        self.outbound
            .send(Outbound::Frame(body))
            .map_err(|_| McpError::Closed {
                server: self.server.clone(),
                reason: "socket thread exited".to_string(),
            })
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Shutdown);
    }
}

fn socket_loop(
    mut socket: WebSocket<MaybeTlsStream<TcpStream>>,
    outbound: mpsc::Receiver<Outbound>,
    shared: Arc<Mutex<SharedState>>,
    name: String,
) {
    let reason: String = 'conn: loop {
        loop {
            match outbound.try_recv() {
                Ok(Outbound::Frame(body)) => {
                    if let Err(err) = socket.send(Message::text(body)) {
                        break 'conn format!("write error: {err}");
                    }
                }
                Ok(Outbound::Shutdown) | Err(TryRecvError::Disconnected) => {
                    let _ = socket.close(None);
                    let _ = socket.flush();
                    break 'conn "session closed".to_string();
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => handle_frame(&shared, &name, text.as_bytes()),
            Ok(Message::Binary(data)) => handle_frame(&shared, &name, &data),
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => break 'conn "server closed the socket".to_string(),
            Ok(_) => {}
            // Read timeout: nothing inbound this tick, go drain outbound.
            Err(tungstenite::Error::Io(err))
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => break 'conn format!("read error: {err}"),
        }
    };
    session::evict_all(&shared, &name, &reason);
}

/// One JSON document per frame; an undecodable frame is logged and dropped
/// without killing the connection.
fn handle_frame(shared: &Mutex<SharedState>, name: &str, raw: &[u8]) {
    match serde_json::from_slice::<serde_json::Value>(raw) {
        Ok(payload) => session::dispatch(shared, name, payload),
        Err(err) => eprintln!("[mcp:{name}] dropping undecodable frame: {err}"),
    }
}

// ── Http: one round trip per call ────────────────────────────────────────

pub(crate) struct HttpTransport {
    pub(crate) server: String,
    url: String,
    agent: ureq::Agent,
    headers: Vec<(String, String)>,
    timeout_secs: u64,
}

impl HttpTransport {
    fn new(config: &McpServerConfig, url: &str) -> Self {
        let timeout = config.call_timeout();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        HttpTransport {
            server: config.name.clone(),
            url: url.to_string(),
            agent,
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Send the request document, await and decode the single reply body.
    /// Resolves the caller directly; nothing goes through the pending table
    /// because there is no independent inbound stream to correlate against.
    pub(crate) fn round_trip(
        &self,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let mut request = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json");
        for (key, value) in &self.headers {
            request = request.set(key, value);
        }

        let response = match request.send_json(payload) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(McpError::Protocol {
                    server: self.server.clone(),
                    reason: format!("unexpected http status {code}"),
                });
            }
            Err(err) => {
                let reason = err.to_string();
                if reason.contains("timed out") {
                    return Err(McpError::Timeout {
                        server: self.server.clone(),
                        seconds: self.timeout_secs,
                    });
                }
                return Err(McpError::Connect {
                    server: self.server.clone(),
                    reason,
                });
            }
        };

        response
            .into_json::<serde_json::Value>()
            .map_err(|e| McpError::Protocol {
                server: self.server.clone(),
                reason: format!("decode: {e}"),
            })
    }
}
