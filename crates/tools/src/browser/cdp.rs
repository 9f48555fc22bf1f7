//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! Commands are matched to responses by id; events are fanned out to
//! subscribers by method name. When the socket closes, every pending command
//! fails with [`BrowserError::Disconnected`] and the client stays dead.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use super::error::{BrowserError, BrowserResult};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type ListenerMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;

/// Mouse button for `Input.dispatchMouseEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    None,
    Left,
}

impl MouseButton {
    fn as_str(self) -> &'static str {
        match self {
            MouseButton::None => "none",
            MouseButton::Left => "left",
        }
    }

    /// Bitmask of held buttons, as CDP expects in `buttons`.
    fn mask(self) -> u32 {
        match self {
            MouseButton::None => 0,
            MouseButton::Left => 1,
        }
    }
}

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    event_listeners: ListenerMap,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a page's CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> BrowserResult<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url).await.map_err(|e| {
            BrowserError::NotConnected(format!("CDP endpoint {}: {}", ws_url, e))
        })?;

        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let event_listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = connected.clone();
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_events = event_listeners.clone();
        let reader_connected = connected.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = reader_pending.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let params = val.get("params").cloned().unwrap_or(Value::Null);
                            fan_out(&mut *reader_events.lock().await, method, params);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by browser");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with a closed channel.
            reader_pending.lock().await.clear();
            reader_events.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            connected,
            reader_handle,
            writer_handle,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a CDP command and wait up to 30s for its result.
    pub async fn send_command(&self, method: &str, params: Value) -> BrowserResult<Value> {
        if !self.is_connected() {
            return Err(BrowserError::Disconnected(format!(
                "CDP socket closed before '{}'",
                method
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(BrowserError::Disconnected(format!(
                "CDP writer gone while sending '{}'",
                method
            )));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => match response.get("error") {
                Some(error) => Err(BrowserError::Driver(format!("{}: {}", method, error))),
                None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(BrowserError::Disconnected(format!(
                "CDP socket closed during '{}'",
                method
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(BrowserError::Timeout(format!(
                    "CDP command '{}' timed out after {}s",
                    method,
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Subscribe to a CDP event. The receiver gets each event's params.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        self.event_listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    #[cfg(test)]
    async fn listener_count(&self, method: &str) -> usize {
        self.event_listeners
            .lock()
            .await
            .get(method)
            .map_or(0, |senders| senders.len())
    }

    /// Enable a CDP domain (e.g. "Page", "Runtime").
    pub async fn enable_domain(&self, domain: &str) -> BrowserResult<()> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> BrowserResult<Value> {
        let result = self
            .send_command("Page.navigate", json!({"url": url}))
            .await?;
        if let Some(error_text) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(BrowserError::Driver(format!(
                "navigation to {} failed: {}",
                url, error_text
            )));
        }
        Ok(result)
    }

    /// Move `delta` entries through the session history. Returns `false`
    /// when there is no entry in that direction.
    pub async fn navigate_history(&self, delta: i64) -> BrowserResult<bool> {
        let history = self
            .send_command("Page.getNavigationHistory", json!({}))
            .await?;
        let current = history
            .get("currentIndex")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let entries = history
            .get("entries")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let target = current + delta;
        if target < 0 || target as usize >= entries.len() {
            return Ok(false);
        }
        let Some(entry_id) = entries[target as usize].get("id").and_then(|v| v.as_i64()) else {
            return Ok(false);
        };
        self.send_command("Page.navigateToHistoryEntry", json!({"entryId": entry_id}))
            .await?;
        Ok(true)
    }

    /// Evaluate JavaScript in the page, awaiting promises and returning by value.
    pub async fn evaluate_js(&self, expression: &str) -> BrowserResult<Value> {
        self.send_command(
            "Runtime.evaluate",
            json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": true,
            }),
        )
        .await
    }

    /// CSS viewport size in pixels.
    pub async fn layout_viewport(&self) -> BrowserResult<(f64, f64)> {
        let metrics = self
            .send_command("Page.getLayoutMetrics", json!({}))
            .await?;
        let viewport = metrics
            .get("cssLayoutViewport")
            .or_else(|| metrics.get("layoutViewport"))
            .ok_or_else(|| BrowserError::Driver("no layout viewport in metrics".into()))?;
        let width = viewport.get("clientWidth").and_then(|v| v.as_f64());
        let height = viewport.get("clientHeight").and_then(|v| v.as_f64());
        match (width, height) {
            (Some(w), Some(h)) => Ok((w, h)),
            _ => Err(BrowserError::Driver("malformed layout viewport".into())),
        }
    }

    pub async fn dispatch_mouse_event(
        &self,
        event_type: &str,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: i32,
    ) -> BrowserResult<()> {
        self.send_command(
            "Input.dispatchMouseEvent",
            json!({
                "type": event_type,
                "x": x,
                "y": y,
                "button": button.as_str(),
                "buttons": button.mask(),
                "clickCount": click_count,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn dispatch_mouse_wheel(
        &self,
        x: f64,
        y: f64,
        delta_x: f64,
        delta_y: f64,
    ) -> BrowserResult<()> {
        self.send_command(
            "Input.dispatchMouseEvent",
            json!({
                "type": "mouseWheel",
                "x": x,
                "y": y,
                "deltaX": delta_x,
                "deltaY": delta_y,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn dispatch_key_event(
        &self,
        event_type: &str,
        key: &str,
        code: &str,
        modifiers: i32,
    ) -> BrowserResult<()> {
        let mut params = json!({
            "type": event_type,
            "key": key,
            "code": code,
        });
        if modifiers != 0 {
            params["modifiers"] = json!(modifiers);
        }
        // Printable characters without a command modifier also produce text.
        if event_type == "keyDown" && key.chars().count() == 1 && modifiers & !MODIFIER_SHIFT == 0 {
            params["text"] = json!(key);
        }
        if event_type == "keyDown" && key == "Enter" {
            params["text"] = json!("\r");
        }
        self.send_command("Input.dispatchKeyEvent", params).await?;
        Ok(())
    }

    /// Insert text at the focused element without per-key events.
    pub async fn insert_text(&self, text: &str) -> BrowserResult<()> {
        self.send_command("Input.insertText", json!({"text": text}))
            .await?;
        Ok(())
    }

    pub async fn close_browser(&self) -> BrowserResult<()> {
        self.send_command("Browser.close", json!({})).await?;
        Ok(())
    }
}

/// Deliver an event to its subscribers, dropping any whose receiver is gone.
fn fan_out(listeners: &mut HashMap<String, Vec<mpsc::Sender<Value>>>, method: &str, params: Value) {
    let Some(senders) = listeners.get_mut(method) else {
        return;
    };
    senders.retain(|tx| {
        !matches!(
            tx.try_send(params.clone()),
            Err(mpsc::error::TrySendError::Closed(_))
        )
    });
    if senders.is_empty() {
        listeners.remove(method);
    }
}

pub(crate) const MODIFIER_ALT: i32 = 1;
pub(crate) const MODIFIER_CTRL: i32 = 2;
pub(crate) const MODIFIER_META: i32 = 4;
pub(crate) const MODIFIER_SHIFT: i32 = 8;

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}
