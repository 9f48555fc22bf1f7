//! In-memory stand-ins for the router's collaborators.

use async_trait::async_trait;
use pilotdeck_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::coords::Viewport;
use super::error::{BrowserError, BrowserResult};
use super::launcher::{BrowserLauncher, PortAllocator};
use super::surface::AutomationSurface;
use crate::mcp::{ConnectionManager, ConnectionStatus, ProtocolClient, ServerSpec};

/// Ordered record of collaborator calls shared across mocks.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn note(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceCall {
    Navigate(String),
    Back,
    Forward,
    CurrentUrl,
    Evaluate(String),
    Viewport,
    Move(f64, f64, u32),
    Down,
    Up,
    Wheel(f64, f64),
    Type(String),
    Press(String),
    Close,
}

pub struct MockSurface {
    viewport: Viewport,
    calls: Mutex<Vec<SurfaceCall>>,
    url: Mutex<String>,
    eval_reply: Mutex<Value>,
    fail_next: Mutex<Option<BrowserError>>,
    connected: AtomicBool,
}

impl MockSurface {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            viewport: Viewport::new(width, height),
            calls: Mutex::new(Vec::new()),
            url: Mutex::new("about:blank".into()),
            eval_reply: Mutex::new(Value::Null),
            fail_next: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_eval_reply(&self, v: Value) {
        *self.eval_reply.lock().unwrap() = v;
    }

    /// Make the next pointer or script call fail with `err`.
    pub fn fail_next(&self, err: BrowserError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn record(&self, call: SurfaceCall) -> BrowserResult<()> {
        self.calls.lock().unwrap().push(call);
        match self.fail_next.lock().unwrap().take() {
            Some(err) => {
                if err.is_disconnect() {
                    self.set_connected(false);
                }
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AutomationSurface for MockSurface {
    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        self.record(SurfaceCall::Navigate(url.into()))?;
        *self.url.lock().unwrap() = url.into();
        Ok(())
    }

    async fn go_back(&self) -> BrowserResult<bool> {
        self.record(SurfaceCall::Back)?;
        Ok(true)
    }

    async fn go_forward(&self) -> BrowserResult<bool> {
        self.record(SurfaceCall::Forward)?;
        Ok(false)
    }

    async fn current_url(&self) -> BrowserResult<String> {
        self.record(SurfaceCall::CurrentUrl)?;
        Ok(self.url.lock().unwrap().clone())
    }

    async fn evaluate(&self, expression: &str) -> BrowserResult<Value> {
        self.record(SurfaceCall::Evaluate(expression.into()))?;
        Ok(self.eval_reply.lock().unwrap().clone())
    }

    async fn viewport_size(&self) -> BrowserResult<Viewport> {
        self.record(SurfaceCall::Viewport)?;
        Ok(self.viewport)
    }

    async fn mouse_move(&self, x: f64, y: f64, steps: u32) -> BrowserResult<()> {
        self.record(SurfaceCall::Move(x, y, steps))
    }

    async fn mouse_down(&self) -> BrowserResult<()> {
        self.record(SurfaceCall::Down)
    }

    async fn mouse_up(&self) -> BrowserResult<()> {
        self.record(SurfaceCall::Up)
    }

    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64) -> BrowserResult<()> {
        self.record(SurfaceCall::Wheel(delta_x, delta_y))
    }

    async fn keyboard_type(&self, text: &str) -> BrowserResult<()> {
        self.record(SurfaceCall::Type(text.into()))
    }

    async fn keyboard_press(&self, key: &str) -> BrowserResult<()> {
        self.record(SurfaceCall::Press(key.into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.calls.lock().unwrap().push(SurfaceCall::Close);
        self.set_connected(false);
    }
}

pub struct MockProtocolClient {
    status: Mutex<ConnectionStatus>,
    calls: Mutex<Vec<(String, Value)>>,
    reply: Mutex<Value>,
    fail_next: Mutex<Option<(String, bool)>>,
    connects: AtomicUsize,
    journal: Option<Journal>,
}

impl MockProtocolClient {
    fn with_status(status: ConnectionStatus, journal: Option<Journal>) -> Self {
        Self {
            status: Mutex::new(status),
            calls: Mutex::new(Vec::new()),
            reply: Mutex::new(Value::String(String::new())),
            fail_next: Mutex::new(None),
            connects: AtomicUsize::new(0),
            journal,
        }
    }

    pub fn connected() -> Self {
        Self::with_status(ConnectionStatus::Connected, None)
    }

    pub fn disconnected(journal: Journal) -> Self {
        Self::with_status(ConnectionStatus::Disconnected, Some(journal))
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_reply(&self, v: Value) {
        *self.reply.lock().unwrap() = v;
    }

    /// Fail the next call; with `disconnect` the client also drops its connection.
    pub fn fail_next(&self, message: &str, disconnect: bool) {
        *self.fail_next.lock().unwrap() = Some((message.into(), disconnect));
    }

    pub fn drop_connection(&self) {
        *self.status.lock().unwrap() = ConnectionStatus::Disconnected;
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            note(journal, "connect".into());
        }
        *self.status.lock().unwrap() = ConnectionStatus::Connected;
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.calls.lock().unwrap().push((name.into(), arguments));
        if let Some((message, disconnect)) = self.fail_next.lock().unwrap().take() {
            if disconnect {
                self.drop_connection();
            }
            return Err(Error::Tool(message));
        }
        Ok(self.reply.lock().unwrap().clone())
    }

    async fn close(&self) {
        self.drop_connection();
    }
}

/// Hands out one mock client per registration and remembers every spec.
pub struct MockManager {
    servers: Mutex<HashMap<String, (ServerSpec, Arc<MockProtocolClient>)>>,
    registrations: Mutex<Vec<ServerSpec>>,
    unregistered: AtomicUsize,
    journal: Journal,
}

impl MockManager {
    pub fn new(journal: Journal) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            registrations: Mutex::new(Vec::new()),
            unregistered: AtomicUsize::new(0),
            journal,
        }
    }

    /// Pre-register a server as if another component had done it.
    pub fn preload(&self, spec: ServerSpec, client: Arc<MockProtocolClient>) {
        self.servers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), (spec, client));
    }

    pub fn registrations(&self) -> Vec<ServerSpec> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> usize {
        self.unregistered.load(Ordering::SeqCst)
    }

    pub fn mock_client(&self, name: &str) -> Option<Arc<MockProtocolClient>> {
        self.servers.lock().unwrap().get(name).map(|(_, c)| c.clone())
    }
}

#[async_trait]
impl ConnectionManager for MockManager {
    async fn client(&self, name: &str) -> Option<Arc<dyn ProtocolClient>> {
        self.mock_client(name).map(|c| c as Arc<dyn ProtocolClient>)
    }

    async fn registration(&self, name: &str) -> Option<ServerSpec> {
        self.servers.lock().unwrap().get(name).map(|(s, _)| s.clone())
    }

    async fn register_server(&self, spec: ServerSpec) -> Result<Arc<dyn ProtocolClient>> {
        note(&self.journal, format!("register {}", spec.args.join(" ")));
        self.registrations.lock().unwrap().push(spec.clone());
        let client = Arc::new(MockProtocolClient::disconnected(self.journal.clone()));
        self.servers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), (spec, client.clone()));
        Ok(client)
    }

    async fn unregister(&self, name: &str) {
        let removed = self.servers.lock().unwrap().remove(name);
        if let Some((_, client)) = removed {
            client.drop_connection();
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            note(&self.journal, format!("unregister {}", name));
        }
    }
}

pub struct MockLauncher {
    launches: AtomicUsize,
    attaches: AtomicUsize,
    delay: Duration,
    fail_attach: AtomicBool,
    surfaces: Mutex<Vec<Arc<MockSurface>>>,
    journal: Journal,
}

impl MockLauncher {
    pub fn new(journal: Journal) -> Self {
        Self {
            launches: AtomicUsize::new(0),
            attaches: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_attach: AtomicBool::new(false),
            surfaces: Mutex::new(Vec::new()),
            journal,
        }
    }

    /// Launches take `delay`, to widen races between concurrent first calls.
    pub fn slow(journal: Journal, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(journal)
        }
    }

    pub fn fail_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    /// The most recently created surface.
    pub fn surface(&self) -> Arc<MockSurface> {
        self.surfaces
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no surface created yet")
    }

    fn make_surface(&self) -> Arc<dyn AutomationSurface> {
        let surface = Arc::new(MockSurface::new(1024.0, 768.0));
        self.surfaces.lock().unwrap().push(surface.clone());
        surface
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self, port: u16) -> BrowserResult<Arc<dyn AutomationSurface>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        note(&self.journal, format!("launch {}", port));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.make_surface())
    }

    async fn attach(&self, port: u16) -> BrowserResult<Arc<dyn AutomationSurface>> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        note(&self.journal, format!("attach {}", port));
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(BrowserError::NotConnected(format!("nothing on port {}", port)));
        }
        Ok(self.make_surface())
    }
}

/// Always returns the same port and counts how often it was asked.
pub struct FixedPorts {
    port: u16,
    calls: AtomicUsize,
    journal: Journal,
}

impl FixedPorts {
    pub fn new(port: u16, journal: Journal) -> Self {
        Self {
            port,
            calls: AtomicUsize::new(0),
            journal,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PortAllocator for FixedPorts {
    fn allocate(&self) -> BrowserResult<u16> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        note(&self.journal, format!("allocate {}", self.port));
        Ok(self.port)
    }
}

/// A one-page CDP endpoint on localhost.
///
/// Every command is recorded and answered. `Page.navigate` to a URL with a
/// `#fragment` is reported as same-document: no `loaderId` and no load event.
/// Any other navigation gets a `loaderId` followed by `Page.loadEventFired`.
pub struct FakePage {
    pub ws_url: String,
    commands: Arc<Mutex<Vec<Value>>>,
}

impl FakePage {
    pub async fn start() -> Self {
        use futures::{SinkExt, StreamExt};
        use serde_json::json;
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let seen = commands.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let cmd: Value = serde_json::from_str(&text).unwrap();
                seen.lock().unwrap().push(cmd.clone());

                let mut fire_load = false;
                let result = if cmd["method"] == "Page.navigate" {
                    let url = cmd["params"]["url"].as_str().unwrap_or_default();
                    if url.contains('#') {
                        json!({"frameId": "main"})
                    } else {
                        fire_load = true;
                        json!({"frameId": "main", "loaderId": "loader-1"})
                    }
                } else {
                    json!({})
                };
                let reply = json!({"id": cmd["id"], "result": result});
                if ws.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
                if fire_load {
                    let event = json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.0}});
                    if ws.send(Message::Text(event.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            ws_url: format!("ws://{}/devtools/page/fake", addr),
            commands,
        }
    }

    /// Params of every recorded command named `method`, in arrival order.
    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c["method"] == method)
            .map(|c| c["params"].clone())
            .collect()
    }
}
