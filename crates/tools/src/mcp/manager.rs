use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pilotdeck_core::config::InspectionServerConfig;
use pilotdeck_core::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::{McpClient, ProtocolClient};

const BROWSER_URL_FLAG: &str = "--browser-url";

/// How to launch one MCP server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServerSpec {
    pub fn from_config(config: &InspectionServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }

    /// This spec pointed at a browser already listening on `port`.
    /// Any existing `--browser-url` argument is replaced.
    pub fn with_browser_url(mut self, port: u16) -> Self {
        let mut args = Vec::with_capacity(self.args.len() + 2);
        let mut iter = self.args.into_iter();
        while let Some(arg) = iter.next() {
            if arg == BROWSER_URL_FLAG {
                iter.next();
            } else if !arg.starts_with("--browser-url=") {
                args.push(arg);
            }
        }
        args.push(BROWSER_URL_FLAG.to_string());
        args.push(format!("http://127.0.0.1:{}", port));
        self.args = args;
        self
    }

    /// The port of the `--browser-url` argument, in either `--browser-url URL`
    /// or `--browser-url=URL` form.
    pub fn browser_port(&self) -> Option<u16> {
        let url = self.args.iter().enumerate().find_map(|(i, arg)| {
            if arg == BROWSER_URL_FLAG {
                self.args.get(i + 1).map(String::as_str)
            } else {
                arg.strip_prefix("--browser-url=")
            }
        })?;
        let authority = url.split("://").nth(1).unwrap_or(url);
        let host_port = authority.split('/').next()?;
        host_port.rsplit_once(':')?.1.parse().ok()
    }
}

/// Owns protocol clients by server name.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// The client of a registered server, connected or not.
    async fn client(&self, name: &str) -> Option<Arc<dyn ProtocolClient>>;

    async fn registration(&self, name: &str) -> Option<ServerSpec>;

    /// Register (or replace) a server and return its unconnected client.
    async fn register_server(&self, spec: ServerSpec) -> Result<Arc<dyn ProtocolClient>>;

    /// Close the server's client and forget it.
    async fn unregister(&self, name: &str);
}

struct Entry {
    spec: ServerSpec,
    client: Arc<McpClient>,
}

#[derive(Default)]
pub struct McpConnectionManager {
    servers: RwLock<HashMap<String, Entry>>,
}

impl McpConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ConnectionManager for McpConnectionManager {
    async fn client(&self, name: &str) -> Option<Arc<dyn ProtocolClient>> {
        self.servers
            .read()
            .await
            .get(name)
            .map(|e| e.client.clone() as Arc<dyn ProtocolClient>)
    }

    async fn registration(&self, name: &str) -> Option<ServerSpec> {
        self.servers.read().await.get(name).map(|e| e.spec.clone())
    }

    async fn register_server(&self, spec: ServerSpec) -> Result<Arc<dyn ProtocolClient>> {
        let name = spec.name.clone();
        let client = Arc::new(McpClient::new(spec.clone()));
        let previous = self.servers.write().await.insert(
            name.clone(),
            Entry {
                spec,
                client: client.clone(),
            },
        );
        if let Some(old) = previous {
            old.client.close().await;
        }
        info!(server = %name, "MCP server registered");
        Ok(client)
    }

    async fn unregister(&self, name: &str) {
        let removed = self.servers.write().await.remove(name);
        if let Some(entry) = removed {
            entry.client.close().await;
            info!(server = %name, "MCP server unregistered");
        }
    }
}
