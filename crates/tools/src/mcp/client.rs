use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pilotdeck_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::{ConnectionStatus, ProtocolClient, ServerSpec};

// ─── JSON-RPC types ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

// ─── MCP Client ───────────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>>>;

/// Connection status tagged with the session generation that set it, so a
/// reader task from an old session cannot mark a newer one disconnected.
struct StatusCell(AtomicU64);

impl StatusCell {
    fn new() -> Self {
        Self(AtomicU64::new(ConnectionStatus::Disconnected.as_u8() as u64))
    }

    fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8((self.0.load(Ordering::SeqCst) & 0xff) as u8)
    }

    fn set(&self, status: ConnectionStatus) {
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            Some((v & !0xff) | status.as_u8() as u64)
        });
    }

    /// Start a new generation in `Connecting` and return its number.
    fn begin(&self) -> u64 {
        let mut generation = 0;
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            generation = (v >> 8) + 1;
            Some((generation << 8) | ConnectionStatus::Connecting.as_u8() as u64)
        });
        generation
    }

    fn mark_connected(&self, generation: u64) -> bool {
        self.0
            .compare_exchange(
                (generation << 8) | ConnectionStatus::Connecting.as_u8() as u64,
                (generation << 8) | ConnectionStatus::Connected.as_u8() as u64,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn mark_closed(&self, generation: u64) {
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            (v >> 8 == generation)
                .then_some((generation << 8) | ConnectionStatus::Disconnected.as_u8() as u64)
        });
    }
}

struct Session {
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    child: Child,
}

/// JSON-RPC client for an MCP server spoken over the child's stdio.
///
/// The process is not started until [`ProtocolClient::connect`]. When the
/// server's stdout closes, the status drops back to `Disconnected` and every
/// waiting call fails.
pub struct McpClient {
    spec: ServerSpec,
    status: Arc<StatusCell>,
    next_id: AtomicU64,
    session: Mutex<Option<Session>>,
}

impl McpClient {
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            status: Arc::new(StatusCell::new()),
            next_id: AtomicU64::new(1),
            session: Mutex::new(None),
        }
    }

    async fn spawn(&self, generation: u64) -> Result<Session> {
        let name = &self.spec.name;
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in &self.spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Tool(format!(
                "MCP[{}]: failed to spawn '{}': {}",
                name, self.spec.command, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Tool(format!("MCP[{}]: no stdin", name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Tool(format!("MCP[{}]: no stdout", name)))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(reader_task(
            stdout,
            pending.clone(),
            self.status.clone(),
            generation,
            name.clone(),
        ));

        Ok(Session {
            stdin: Arc::new(Mutex::new(stdin)),
            pending,
            child,
        })
    }

    /// Send a JSON-RPC request and wait for the response.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let name = &self.spec.name;
        if self.status() == ConnectionStatus::Disconnected {
            return Err(Error::Tool(format!("MCP[{}]: not connected", name)));
        }
        let (stdin, pending) = {
            let guard = self.session.lock().await;
            let session = guard
                .as_ref()
                .ok_or_else(|| Error::Tool(format!("MCP[{}]: not connected", name)))?;
            (session.stdin.clone(), session.pending.clone())
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let line = serde_json::to_string(&req)?;

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(id, tx);

        debug!(server = %name, id, method, "MCP → request");
        if let Err(e) = write_line(&stdin, &line).await {
            pending.lock().await.remove(&id);
            return Err(Error::Tool(format!("MCP[{}]: write error: {}", name, e)));
        }

        rx.await
            .map_err(|_| Error::Tool(format!("MCP[{}]: server closed", name)))?
            .map_err(|e| Error::Tool(format!("MCP[{}]: {}", name, e)))
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "pilotdeck",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self.call("initialize", Some(params)).await?;
        debug!(server = %self.spec.name, ?result, "MCP initialized");

        let notif = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        });
        let stdin = {
            let guard = self.session.lock().await;
            guard.as_ref().map(|s| s.stdin.clone())
        };
        if let Some(stdin) = stdin {
            if let Err(e) = write_line(&stdin, &notif.to_string()).await {
                warn!(server = %self.spec.name, error = %e, "MCP: initialized notification failed");
            }
        }
        Ok(())
    }
}

async fn write_line(stdin: &Mutex<ChildStdin>, line: &str) -> std::io::Result<()> {
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

#[async_trait]
impl ProtocolClient for McpClient {
    async fn connect(&self) -> Result<()> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        let generation = self.status.begin();

        let session = match self.spawn(generation).await {
            Ok(s) => s,
            Err(e) => {
                self.status.mark_closed(generation);
                return Err(e);
            }
        };
        if let Some(mut old) = self.session.lock().await.replace(session) {
            let _ = old.child.start_kill();
        }

        if let Err(e) = self.initialize().await {
            self.close().await;
            return Err(e);
        }

        if !self.status.mark_connected(generation) {
            self.close().await;
            return Err(Error::Tool(format!(
                "MCP[{}]: server exited during handshake",
                self.spec.name
            )));
        }
        info!(server = %self.spec.name, "MCP server connected");
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let params = json!({
            "name": name,
            "arguments": arguments
        });
        let result = self.call("tools/call", Some(params)).await?;
        tool_result_content(result)
    }

    async fn close(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            if let Err(e) = session.child.start_kill() {
                debug!(server = %self.spec.name, error = %e, "MCP server already exited");
            }
        }
        self.status.set(ConnectionStatus::Disconnected);
    }
}

/// Unwrap a `tools/call` result: `isError` becomes `Err`, text blocks are
/// joined into one string, anything else is returned as-is.
fn tool_result_content(result: Value) -> Result<Value> {
    if let Some(true) = result.get("isError").and_then(|v| v.as_bool()) {
        let msg = result
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|item| item.get("text"))
            .and_then(|t| t.as_str())
            .unwrap_or("MCP tool returned an error");
        return Err(Error::Tool(msg.to_string()));
    }

    let content = result.get("content").cloned().unwrap_or(Value::Null);
    if let Some(arr) = content.as_array() {
        let text = arr
            .iter()
            .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            return Ok(Value::String(text));
        }
    }
    Ok(content)
}

/// Dispatches incoming responses to waiting callers until stdout closes.
async fn reader_task(
    stdout: ChildStdout,
    pending: PendingMap,
    status: Arc<StatusCell>,
    generation: u64,
    server_name: String,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                debug!(server = %server_name, "MCP ← {}", crate::safe_truncate(&line, 200));
                match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(resp) => {
                        // Notifications carry no id.
                        let Some(id) = resp.id else { continue };
                        if let Some(tx) = pending.lock().await.remove(&id) {
                            let payload = match resp.error {
                                Some(err) => {
                                    Err(format!("JSON-RPC error {}: {}", err.code, err.message))
                                }
                                None => Ok(resp.result.unwrap_or(Value::Null)),
                            };
                            let _ = tx.send(payload);
                        }
                    }
                    Err(e) => {
                        warn!(server = %server_name, "MCP: failed to parse response: {}", e);
                    }
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                error!(server = %server_name, "MCP: stdout closed");
                break;
            }
            Err(e) => {
                error!(server = %server_name, "MCP: read error: {}", e);
                break;
            }
        }
    }

    status.mark_closed(generation);
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err("MCP server stdout closed".to_string()));
    }
}
