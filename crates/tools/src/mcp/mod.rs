//! Model Context Protocol plumbing: a stdio JSON-RPC client and a manager
//! that owns one client per registered server.

pub mod client;
pub mod manager;

use async_trait::async_trait;
use pilotdeck_core::Result;
use serde_json::Value;

pub use client::McpClient;
pub use manager::{ConnectionManager, McpConnectionManager, ServerSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionStatus::Disconnected => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Connected => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// A client for one inspection server.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Start the server and complete the handshake. A no-op when already connected.
    async fn connect(&self) -> Result<()>;

    fn status(&self) -> ConnectionStatus;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    async fn close(&self);
}
