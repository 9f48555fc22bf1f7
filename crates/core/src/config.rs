use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// Launch description of the MCP inspection server that shares the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_command")]
    pub command: String,
    #[serde(default = "default_server_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_server_name() -> String {
    "chrome-devtools".to_string()
}

fn default_server_command() -> String {
    "npx".to_string()
}

fn default_server_args() -> Vec<String> {
    vec!["-y".to_string(), "chrome-devtools-mcp@latest".to_string()]
}

impl Default for InspectionServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            command: default_server_command(),
            args: default_server_args(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// Launch a visible browser window instead of a headless one.
    #[serde(default)]
    pub headed: bool,
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Profile name; each profile gets its own user data dir.
    #[serde(default = "default_session")]
    pub session: String,
    #[serde(default)]
    pub inspection_server: InspectionServerConfig,
    /// Intermediate mousemove events emitted between drag source and destination.
    #[serde(default = "default_drag_steps")]
    pub drag_steps: u32,
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
}

fn default_engine() -> String {
    "chrome".to_string()
}

fn default_session() -> String {
    "default".to_string()
}

fn default_drag_steps() -> u32 {
    10
}

fn default_launch_timeout() -> u64 {
    15
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headed: false,
            engine: default_engine(),
            session: default_session(),
            inspection_server: InspectionServerConfig::default(),
            drag_steps: default_drag_steps(),
            launch_timeout_secs: default_launch_timeout(),
        }
    }
}

/// Shell commands fired around every tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HooksConfig {
    #[serde(default)]
    pub before_tool: Vec<String>,
    #[serde(default)]
    pub after_tool: Vec<String>,
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

fn default_hook_timeout() -> u64 {
    30
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            before_tool: Vec::new(),
            after_tool: Vec::new(),
            timeout_secs: default_hook_timeout(),
        }
    }
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.before_tool.is_empty() && self.after_tool.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationConfig {
    /// Upper bound on in-flight call records; the oldest is evicted past it.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Records whose after-event never arrives are dropped after this long.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_max_entries() -> usize {
    1024
}

fn default_ttl_secs() -> u64 {
    600
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityConfig {
    /// Tool-call lifecycle events are POSTed here when set.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_token: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    5
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_token: None,
            webhook_timeout_secs: default_webhook_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            debug!(path = %config_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn webhook_url(&self) -> Option<String> {
        if let Some(url) = self.observability.webhook_url.as_ref() {
            let url = url.trim();
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
        None
    }
}
