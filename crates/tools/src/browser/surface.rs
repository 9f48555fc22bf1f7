//! The direct automation surface: pixel-level pointer and keyboard control
//! plus script evaluation, driven over CDP.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info};

use super::cdp::{CdpClient, MouseButton, MODIFIER_ALT, MODIFIER_CTRL, MODIFIER_META, MODIFIER_SHIFT};
use super::coords::Viewport;
use super::error::{BrowserError, BrowserResult};

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const HISTORY_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait AutomationSurface: Send + Sync {
    async fn navigate(&self, url: &str) -> BrowserResult<()>;

    /// Returns `false` when there is no history entry to go back to.
    async fn go_back(&self) -> BrowserResult<bool>;

    async fn go_forward(&self) -> BrowserResult<bool>;

    async fn current_url(&self) -> BrowserResult<String>;

    /// Evaluate an expression and return its value. A thrown exception is
    /// an [`BrowserError::Evaluation`].
    async fn evaluate(&self, expression: &str) -> BrowserResult<Value>;

    async fn viewport_size(&self) -> BrowserResult<Viewport>;

    /// Move the pointer to `(x, y)` in `steps` interpolated moves.
    async fn mouse_move(&self, x: f64, y: f64, steps: u32) -> BrowserResult<()>;

    async fn mouse_down(&self) -> BrowserResult<()>;

    async fn mouse_up(&self) -> BrowserResult<()>;

    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64) -> BrowserResult<()>;

    async fn keyboard_type(&self, text: &str) -> BrowserResult<()>;

    /// Press a key spec such as `"Enter"` or `"Control+A"`.
    async fn keyboard_press(&self, key: &str) -> BrowserResult<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// CDP page connection plus the browser process it drives, when this side
/// launched it.
pub struct CdpSurface {
    cdp: CdpClient,
    process: Mutex<Option<Child>>,
    pointer: Mutex<PointerState>,
    port: u16,
}

/// Last pointer position and whether the primary button is held.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct PointerState {
    x: f64,
    y: f64,
    pressed: bool,
}

impl PointerState {
    /// Moves carry the held button so the page sees a drag, not a hover.
    fn move_button(&self) -> MouseButton {
        if self.pressed {
            MouseButton::Left
        } else {
            MouseButton::None
        }
    }
}

/// `steps` evenly spaced points from `from` to `to`, not including `from`.
/// There is always at least one point and the last one is exactly `to`.
fn interpolate(from: (f64, f64), to: (f64, f64), steps: u32) -> Vec<(f64, f64)> {
    let steps = steps.max(1);
    (1..=steps)
        .map(|i| {
            if i == steps {
                return to;
            }
            let t = i as f64 / steps as f64;
            (from.0 + (to.0 - from.0) * t, from.1 + (to.1 - from.1) * t)
        })
        .collect()
}

/// CDP leaves `loaderId` out of the `Page.navigate` result when the
/// navigation stays in the current document, which fires no load event.
fn is_same_document(navigate_result: &Value) -> bool {
    navigate_result.get("loaderId").is_none()
}

impl CdpSurface {
    /// Enable the domains the surface relies on and take ownership of
    /// `process` if given.
    pub async fn new(cdp: CdpClient, process: Option<Child>, port: u16) -> BrowserResult<Self> {
        cdp.enable_domain("Page").await?;
        cdp.enable_domain("Runtime").await?;
        Ok(Self {
            cdp,
            process: Mutex::new(process),
            pointer: Mutex::new(PointerState::default()),
            port,
        })
    }

    fn pointer(&self) -> PointerState {
        *self.pointer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_pointer(&self, f: impl FnOnce(&mut PointerState)) {
        f(&mut self.pointer.lock().unwrap_or_else(|e| e.into_inner()));
    }

    async fn history(&self, delta: i64) -> BrowserResult<bool> {
        let mut loaded = self.cdp.subscribe_event("Page.loadEventFired").await;
        let moved = self.cdp.navigate_history(delta).await?;
        if moved && tokio::time::timeout(HISTORY_SETTLE_TIMEOUT, loaded.recv()).await.is_err() {
            debug!(delta, "No load event after history navigation");
        }
        Ok(moved)
    }
}

#[async_trait]
impl AutomationSurface for CdpSurface {
    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        let mut loaded = self.cdp.subscribe_event("Page.loadEventFired").await;
        let result = self.cdp.navigate(url).await?;
        if is_same_document(&result) {
            debug!(url = %url, "Same-document navigation, not waiting for load");
            return Ok(());
        }
        match tokio::time::timeout(NAVIGATION_TIMEOUT, loaded.recv()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(BrowserError::Disconnected(format!(
                "page closed while loading {}",
                url
            ))),
            Err(_) => Err(BrowserError::Timeout(format!(
                "navigation to {} did not finish within {}s",
                url,
                NAVIGATION_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn go_back(&self) -> BrowserResult<bool> {
        self.history(-1).await
    }

    async fn go_forward(&self) -> BrowserResult<bool> {
        self.history(1).await
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self
            .evaluate("location.href")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn evaluate(&self, expression: &str) -> BrowserResult<Value> {
        let result = self.cdp.evaluate_js(expression).await?;
        if let Some(details) = result.get("exceptionDetails") {
            let message = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|d| d.as_str())
                .or_else(|| details.get("text").and_then(|t| t.as_str()))
                .unwrap_or("script threw");
            return Err(BrowserError::Evaluation(message.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn viewport_size(&self) -> BrowserResult<Viewport> {
        let (width, height) = self.cdp.layout_viewport().await?;
        Ok(Viewport::new(width, height))
    }

    async fn mouse_move(&self, x: f64, y: f64, steps: u32) -> BrowserResult<()> {
        let state = self.pointer();
        let button = state.move_button();
        for (px, py) in interpolate((state.x, state.y), (x, y), steps) {
            self.cdp
                .dispatch_mouse_event("mouseMoved", px, py, button, 0)
                .await?;
        }
        self.update_pointer(|p| {
            p.x = x;
            p.y = y;
        });
        Ok(())
    }

    async fn mouse_down(&self) -> BrowserResult<()> {
        let PointerState { x, y, .. } = self.pointer();
        self.cdp
            .dispatch_mouse_event("mousePressed", x, y, MouseButton::Left, 1)
            .await?;
        self.update_pointer(|p| p.pressed = true);
        Ok(())
    }

    async fn mouse_up(&self) -> BrowserResult<()> {
        let PointerState { x, y, .. } = self.pointer();
        self.update_pointer(|p| p.pressed = false);
        self.cdp
            .dispatch_mouse_event("mouseReleased", x, y, MouseButton::Left, 1)
            .await
    }

    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64) -> BrowserResult<()> {
        let PointerState { x, y, .. } = self.pointer();
        self.cdp.dispatch_mouse_wheel(x, y, delta_x, delta_y).await
    }

    async fn keyboard_type(&self, text: &str) -> BrowserResult<()> {
        self.cdp.insert_text(text).await
    }

    async fn keyboard_press(&self, key: &str) -> BrowserResult<()> {
        let spec = KeySpec::parse(key);
        for (modifier_key, modifier_code, _) in spec.held_modifiers() {
            self.cdp
                .dispatch_key_event("rawKeyDown", modifier_key, modifier_code, spec.modifiers)
                .await?;
        }
        self.cdp
            .dispatch_key_event("keyDown", &spec.key, &spec.code, spec.modifiers)
            .await?;
        self.cdp
            .dispatch_key_event("keyUp", &spec.key, &spec.code, spec.modifiers)
            .await?;
        for (modifier_key, modifier_code, _) in spec.held_modifiers().into_iter().rev() {
            self.cdp
                .dispatch_key_event("keyUp", modifier_key, modifier_code, 0)
                .await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.cdp.is_connected()
    }

    async fn close(&self) {
        let child = self
            .process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut child) = child else {
            // Attached to a browser someone else launched; leave it running.
            return;
        };
        if let Err(e) = self.cdp.close_browser().await {
            debug!("CDP Browser.close failed (may already be closed): {}", e);
        }
        let _ = child.kill().await;
        info!(port = self.port, "Browser process closed");
    }
}

impl Drop for CdpSurface {
    fn drop(&mut self) {
        if let Ok(mut process) = self.process.lock() {
            if let Some(child) = process.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

/// A parsed key spec such as `"Enter"`, `"Ctrl+A"` or `"Shift+Tab"`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySpec {
    pub key: String,
    pub code: String,
    pub modifiers: i32,
}

impl KeySpec {
    pub fn parse(spec: &str) -> Self {
        let parts: Vec<&str> = spec.split('+').collect();
        let mut modifiers = 0i32;
        let mut main_key = spec.to_string();

        if parts.len() > 1 {
            for &part in &parts[..parts.len() - 1] {
                match part.to_lowercase().as_str() {
                    "ctrl" | "control" => modifiers |= MODIFIER_CTRL,
                    "alt" | "option" => modifiers |= MODIFIER_ALT,
                    "shift" => modifiers |= MODIFIER_SHIFT,
                    "meta" | "cmd" | "command" => modifiers |= MODIFIER_META,
                    _ => {}
                }
            }
            main_key = parts.last().copied().unwrap_or(spec).to_string();
        }

        let code = match main_key.as_str() {
            "Enter" | "Return" => "Enter",
            "Tab" => "Tab",
            "Escape" | "Esc" => "Escape",
            "Backspace" => "Backspace",
            "Delete" => "Delete",
            "ArrowUp" | "Up" => "ArrowUp",
            "ArrowDown" | "Down" => "ArrowDown",
            "ArrowLeft" | "Left" => "ArrowLeft",
            "ArrowRight" | "Right" => "ArrowRight",
            "Home" => "Home",
            "End" => "End",
            "PageUp" => "PageUp",
            "PageDown" => "PageDown",
            "Space" | " " => "Space",
            _ => {
                if main_key.chars().count() == 1 {
                    let ch = main_key.chars().next().unwrap_or(' ');
                    let code = if ch.is_ascii_digit() {
                        format!("Digit{}", ch)
                    } else {
                        format!("Key{}", ch.to_ascii_uppercase())
                    };
                    // Chrome expects the lowercase key for Ctrl/Meta shortcuts.
                    let key = if modifiers & (MODIFIER_CTRL | MODIFIER_META) != 0 {
                        ch.to_ascii_lowercase().to_string()
                    } else {
                        main_key.clone()
                    };
                    return Self {
                        key,
                        code,
                        modifiers,
                    };
                }
                main_key.as_str()
            }
        }
        .to_string();

        let key = match code.as_str() {
            "Space" => " ".to_string(),
            named if named != main_key => named.to_string(),
            _ => main_key,
        };

        Self {
            key,
            code,
            modifiers,
        }
    }

    fn held_modifiers(&self) -> Vec<(&'static str, &'static str, i32)> {
        [
            ("Control", "ControlLeft", MODIFIER_CTRL),
            ("Alt", "AltLeft", MODIFIER_ALT),
            ("Meta", "MetaLeft", MODIFIER_META),
            ("Shift", "ShiftLeft", MODIFIER_SHIFT),
        ]
        .into_iter()
        .filter(|(_, _, bit)| self.modifiers & bit != 0)
        .collect()
    }
}

/// The "select all" shortcut for the host platform.
pub fn select_all_key() -> &'static str {
    if cfg!(target_os = "macos") {
        "Meta+A"
    } else {
        "Control+A"
    }
}
