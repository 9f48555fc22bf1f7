//! Launching a CDP-controlled browser, or attaching to one already running.

use async_trait::async_trait;
use pilotdeck_core::config::BrowserConfig;
use pilotdeck_core::Paths;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

use super::cdp::CdpClient;
use super::error::{BrowserError, BrowserResult};
use super::surface::{AutomationSurface, CdpSurface};

/// Chromium-family browsers that speak CDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEngine {
    Chrome,
    Edge,
}

impl BrowserEngine {
    pub fn from_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "edge" | "msedge" => Self::Edge,
            _ => Self::Chrome,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Edge => "edge",
        }
    }

    fn candidates(&self) -> &'static [&'static str] {
        match self {
            Self::Chrome => {
                if cfg!(target_os = "macos") {
                    &[
                        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                        "/Applications/Chromium.app/Contents/MacOS/Chromium",
                        "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
                    ]
                } else if cfg!(target_os = "windows") {
                    &[
                        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
                    ]
                } else {
                    &[
                        "google-chrome",
                        "google-chrome-stable",
                        "chromium",
                        "chromium-browser",
                        "/usr/bin/google-chrome",
                        "/usr/bin/chromium",
                    ]
                }
            }
            Self::Edge => {
                if cfg!(target_os = "macos") {
                    &["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"]
                } else if cfg!(target_os = "windows") {
                    &[
                        r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                        r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
                    ]
                } else {
                    &["microsoft-edge", "microsoft-edge-stable", "/usr/bin/microsoft-edge"]
                }
            }
        }
    }
}

/// Find a browser binary for `engine`, checking absolute paths first and
/// bare names on `PATH`.
pub fn find_browser_binary(engine: BrowserEngine) -> Option<PathBuf> {
    for candidate in engine.candidates() {
        let path = Path::new(candidate);
        if path.is_absolute() {
            if path.exists() {
                return Some(path.to_path_buf());
            }
        } else if let Ok(found) = which::which(candidate) {
            return Some(found);
        }
    }
    None
}

/// Starts or attaches to the browser behind the direct automation surface.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch a new browser with its debugging endpoint on `port`.
    async fn launch(&self, port: u16) -> BrowserResult<Arc<dyn AutomationSurface>>;

    /// Connect to a browser someone else launched on `port`.
    async fn attach(&self, port: u16) -> BrowserResult<Arc<dyn AutomationSurface>>;
}

pub trait PortAllocator: Send + Sync {
    fn allocate(&self) -> BrowserResult<u16>;
}

/// Asks the OS for a free loopback port.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPortAllocator;

impl PortAllocator for LocalPortAllocator {
    fn allocate(&self) -> BrowserResult<u16> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .map_err(|e| BrowserError::Launch(format!("failed to bind a free port: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| BrowserError::Launch(format!("failed to read local addr: {}", e)))?
            .port();
        Ok(port)
    }
}

pub struct ChromeLauncher {
    engine: BrowserEngine,
    headed: bool,
    profile_dir: PathBuf,
    ready_timeout: Duration,
}

impl ChromeLauncher {
    pub fn new(engine: BrowserEngine, headed: bool, profile_dir: PathBuf, ready_timeout: Duration) -> Self {
        Self {
            engine,
            headed,
            profile_dir,
            ready_timeout,
        }
    }

    pub fn from_config(config: &BrowserConfig, paths: &Paths) -> Self {
        Self::new(
            BrowserEngine::from_name(&config.engine),
            config.headed,
            paths.browser_profile_dir(&config.session),
            Duration::from_secs(config.launch_timeout_secs),
        )
    }

    async fn connect_page(port: u16) -> BrowserResult<CdpClient> {
        let ws_url = get_page_ws_url(port).await?;
        let cdp = CdpClient::connect(&ws_url).await?;
        debug!(port, ws_url = %ws_url, "CDP connection established (page target)");
        Ok(cdp)
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, port: u16) -> BrowserResult<Arc<dyn AutomationSurface>> {
        let binary = find_browser_binary(self.engine).ok_or_else(|| {
            BrowserError::Launch(format!("{} not found. Please install it.", self.engine.name()))
        })?;

        std::fs::create_dir_all(&self.profile_dir).map_err(|e| {
            BrowserError::Launch(format!(
                "failed to create profile dir {}: {}",
                self.profile_dir.display(),
                e
            ))
        })?;

        let args = build_browser_args(port, &self.profile_dir, self.headed);
        info!(
            port,
            headed = self.headed,
            browser = self.engine.name(),
            binary = %binary.display(),
            "Launching browser"
        );

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::Launch(format!("failed to launch {}: {}", self.engine.name(), e)))?;

        // `child` is killed on drop if anything below fails.
        wait_for_cdp_ready(port, self.ready_timeout).await?;
        let cdp = Self::connect_page(port).await?;
        let surface = CdpSurface::new(cdp, Some(child), port).await?;
        Ok(Arc::new(surface))
    }

    async fn attach(&self, port: u16) -> BrowserResult<Arc<dyn AutomationSurface>> {
        info!(port, "Attaching to running browser");
        let cdp = Self::connect_page(port).await?;
        let surface = CdpSurface::new(cdp, None, port).await?;
        Ok(Arc::new(surface))
    }
}

fn build_browser_args(debug_port: u16, user_data_dir: &Path, headed: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
    ];
    if !headed {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,720".to_string());
    args.push("about:blank".to_string());
    args
}

/// Poll `/json/version` until the browser's CDP endpoint answers.
async fn wait_for_cdp_ready(port: u16, timeout: Duration) -> BrowserResult<String> {
    let start = Instant::now();
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(BrowserError::Launch(format!(
                "CDP not ready after {}s on port {}",
                timeout.as_secs(),
                port
            )));
        }

        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// The WebSocket URL of the first page target on `port`. Retries briefly,
/// since a fresh browser may not have opened its page yet.
pub async fn get_page_ws_url(port: u16) -> BrowserResult<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Vec<Value>>().await else {
            continue;
        };
        if let Some(ws_url) = first_page_ws_url(&targets) {
            return Ok(ws_url);
        }
    }

    Err(BrowserError::NotConnected(format!(
        "no page target on port {} after retries",
        port
    )))
}

fn first_page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(str::to_string)
}
