//! Dual-path browser control.
//!
//! One browser process, two ways in: the direct CDP surface for pointer,
//! keyboard and script work, and the inspection server (over MCP) for
//! snapshots. The router owns the direct surface, asks the connection
//! manager for the protocol client, and makes sure both point at the same
//! browser by registering the server with `--browser-url` set to the port
//! the browser was launched on.

use pilotdeck_core::config::BrowserConfig;
use pilotdeck_core::Paths;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::action::{ActionOutput, BrowserAction, Route, ScrollDirection};
use super::error::{BrowserError, BrowserResult};
use super::launcher::{BrowserLauncher, ChromeLauncher, LocalPortAllocator, PortAllocator};
use super::snapshot::Snapshot;
use super::surface::AutomationSurface;
use crate::mcp::{ConnectionManager, ConnectionStatus, ProtocolClient, ServerSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NoConnection,
    Connecting,
    Connected,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::NoConnection => "no_connection",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Launch spec of the inspection server, without `--browser-url`.
    pub server: ServerSpec,
    pub drag_steps: u32,
}

impl RouterOptions {
    pub fn from_config(config: &BrowserConfig) -> Self {
        Self {
            server: ServerSpec::from_config(&config.inspection_server),
            drag_steps: config.drag_steps,
        }
    }
}

/// Both control surfaces of the shared browser.
#[derive(Clone)]
pub struct Connection {
    pub surface: Arc<dyn AutomationSurface>,
    pub client: Arc<dyn ProtocolClient>,
}

#[derive(Default)]
struct Slots {
    port: Option<u16>,
    surface: Option<Arc<dyn AutomationSurface>>,
    client: Option<Arc<dyn ProtocolClient>>,
}

pub struct BrowserRouter {
    manager: Arc<dyn ConnectionManager>,
    launcher: Arc<dyn BrowserLauncher>,
    ports: Arc<dyn PortAllocator>,
    options: RouterOptions,
    /// Held for the whole connect-or-reuse sequence.
    slots: tokio::sync::Mutex<Slots>,
    state: Mutex<ConnectionState>,
}

fn same_surface(a: &Arc<dyn AutomationSurface>, b: &Arc<dyn AutomationSurface>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl BrowserRouter {
    pub fn new(
        manager: Arc<dyn ConnectionManager>,
        launcher: Arc<dyn BrowserLauncher>,
        ports: Arc<dyn PortAllocator>,
        options: RouterOptions,
    ) -> Self {
        Self {
            manager,
            launcher,
            ports,
            options,
            slots: tokio::sync::Mutex::new(Slots::default()),
            state: Mutex::new(ConnectionState::NoConnection),
        }
    }

    /// A router that launches a local Chromium and a stdio inspection server.
    pub fn from_config(
        config: &BrowserConfig,
        paths: &Paths,
        manager: Arc<dyn ConnectionManager>,
    ) -> Self {
        Self::new(
            manager,
            Arc::new(ChromeLauncher::from_config(config, paths)),
            Arc::new(LocalPortAllocator),
            RouterOptions::from_config(config),
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!(from = %*current, to = %state, "Browser router state");
            *current = state;
        }
    }

    pub fn server_name(&self) -> &str {
        &self.options.server.name
    }

    /// Reuse the live connection, or bring up whichever half is missing.
    pub async fn ensure_connection(&self) -> BrowserResult<Connection> {
        let mut slots = self.slots.lock().await;

        if let (Some(surface), Some(client)) = (&slots.surface, &slots.client) {
            if surface.is_connected() && client.status() == ConnectionStatus::Connected {
                return Ok(Connection {
                    surface: surface.clone(),
                    client: client.clone(),
                });
            }
        }

        self.set_state(ConnectionState::Connecting);
        match self.connect(&mut slots).await {
            Ok(conn) => {
                self.set_state(ConnectionState::Connected);
                Ok(conn)
            }
            Err(e) => {
                warn!(error = %e, "Browser connection failed");
                self.set_state(ConnectionState::NoConnection);
                Err(e)
            }
        }
    }

    async fn connect(&self, slots: &mut Slots) -> BrowserResult<Connection> {
        let name = self.options.server.name.clone();
        let mut registration = self.manager.registration(&name).await;

        let live = slots.surface.clone().filter(|s| s.is_connected());
        let surface = match live {
            Some(surface) => surface,
            None => {
                slots.surface = None;
                let attached = match registration.as_ref().and_then(ServerSpec::browser_port) {
                    Some(port) => match self.launcher.attach(port).await {
                        Ok(surface) => {
                            slots.port = Some(port);
                            Some(surface)
                        }
                        Err(e) => {
                            warn!(port, error = %e, "Registered browser unreachable, relaunching");
                            None
                        }
                    },
                    None => None,
                };
                match attached {
                    Some(surface) => surface,
                    None => {
                        // Whatever is registered does not point at a browser we can drive.
                        if registration.take().is_some() {
                            self.manager.unregister(&name).await;
                        }
                        let port = match slots.port {
                            Some(port) => port,
                            None => {
                                let port = self.ports.allocate()?;
                                slots.port = Some(port);
                                port
                            }
                        };
                        let surface = self.launcher.launch(port).await?;
                        info!(port, "Browser launched");
                        surface
                    }
                }
            }
        };
        slots.surface = Some(surface.clone());

        let client = match registration {
            Some(_) => self.manager.client(&name).await,
            None => None,
        };
        let client = match client {
            Some(client) => client,
            None => {
                let port = slots.port.ok_or_else(|| {
                    BrowserError::NotConnected("no browser port to register".into())
                })?;
                let spec = self.options.server.clone().with_browser_url(port);
                info!(server = %name, port, "Registering inspection server");
                self.manager
                    .register_server(spec)
                    .await
                    .map_err(|e| BrowserError::Protocol(e.to_string()))?
            }
        };

        if client.status() != ConnectionStatus::Connected {
            client
                .connect()
                .await
                .map_err(|e| BrowserError::NotConnected(format!("{}: {}", name, e)))?;
            info!(server = %name, "Inspection server connected");
        }
        slots.client = Some(client.clone());

        Ok(Connection { surface, client })
    }

    /// Run one action on its path. A disconnect closes the router so the
    /// next action reconnects from scratch; other failures leave it as is.
    pub async fn execute(&self, action: BrowserAction) -> BrowserResult<ActionOutput> {
        let name = action.name();
        let conn = self.ensure_connection().await?;
        debug!(action = name, "Browser action");

        let result = match action.route() {
            Route::Direct(direct) => {
                direct
                    .execute(conn.surface.as_ref(), self.options.drag_steps)
                    .await
            }
            Route::Protocol(protocol) => protocol.execute(conn.client.as_ref()).await,
        };

        if let Err(e) = &result {
            if e.is_disconnect() {
                warn!(action = name, error = %e, "Browser disconnected");
                self.mark_closed(&conn.surface).await;
            } else {
                debug!(action = name, error = %e, "Browser action failed");
            }
        }
        result
    }

    async fn mark_closed(&self, failed: &Arc<dyn AutomationSurface>) {
        let mut slots = self.slots.lock().await;
        // Someone may already have reconnected past this surface.
        let current = slots.surface.as_ref().is_some_and(|s| same_surface(s, failed));
        if !current && slots.surface.is_some() {
            return;
        }
        if let Some(surface) = slots.surface.take() {
            surface.close().await;
        }
        slots.client = None;
        self.manager.unregister(&self.options.server.name).await;
        self.set_state(ConnectionState::Closed);
    }

    /// Close the browser this router launched, unregister the inspection
    /// server and move to `Closed`.
    pub async fn close(&self) {
        let mut slots = self.slots.lock().await;
        if let Some(surface) = slots.surface.take() {
            surface.close().await;
        }
        slots.client = None;
        self.manager.unregister(&self.options.server.name).await;
        self.set_state(ConnectionState::Closed);
        info!("Browser router closed");
    }

    pub async fn navigate(&self, url: &str) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::Navigate { url: url.into() }).await
    }

    pub async fn click_at(&self, x: f64, y: f64) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::ClickAt { x, y }).await
    }

    pub async fn hover_at(&self, x: f64, y: f64) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::HoverAt { x, y }).await
    }

    pub async fn type_text_at(
        &self,
        x: f64,
        y: f64,
        text: &str,
        press_enter: bool,
        clear_before_typing: bool,
    ) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::TypeTextAt {
            x,
            y,
            text: text.into(),
            press_enter,
            clear_before_typing,
        })
        .await
    }

    pub async fn drag_and_drop(
        &self,
        x: f64,
        y: f64,
        destination_x: f64,
        destination_y: f64,
    ) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::DragAndDrop {
            x,
            y,
            destination_x,
            destination_y,
        })
        .await
    }

    pub async fn scroll_document(
        &self,
        direction: ScrollDirection,
        amount: f64,
    ) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::ScrollDocument { direction, amount })
            .await
    }

    pub async fn scroll_at(
        &self,
        x: f64,
        y: f64,
        direction: ScrollDirection,
        magnitude: f64,
    ) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::ScrollAt {
            x,
            y,
            direction,
            magnitude,
        })
        .await
    }

    pub async fn key_combination(&self, keys: &str) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::KeyCombination { keys: keys.into() })
            .await
    }

    pub async fn go_back(&self) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::GoBack).await
    }

    pub async fn go_forward(&self) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::GoForward).await
    }

    /// Run `code` as the body of an async function and return `{output}`.
    pub async fn evaluate_script(&self, code: &str) -> BrowserResult<ActionOutput> {
        self.execute(BrowserAction::EvaluateScript { code: code.into() })
            .await
    }

    pub async fn take_snapshot(&self) -> BrowserResult<Snapshot> {
        let out = self.execute(BrowserAction::TakeSnapshot).await?;
        out.snapshot
            .ok_or_else(|| BrowserError::Protocol("snapshot missing from reply".into()))
    }

    pub async fn call_protocol_tool(&self, name: &str, arguments: Value) -> BrowserResult<Value> {
        let out = self
            .execute(BrowserAction::CallProtocolTool {
                name: name.into(),
                arguments,
            })
            .await?;
        Ok(out.output.unwrap_or(Value::Null))
    }
}
