//! Browser actions and the path each one takes.
//!
//! Pointer, keyboard, navigation and script actions run on the direct
//! automation surface; snapshots and raw inspection-server tools run through
//! the protocol client. [`BrowserAction::route`] makes that split explicit, and
//! each side only ever sees its own collaborator.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::coords::Viewport;
use super::error::{BrowserError, BrowserResult};
use super::snapshot::Snapshot;
use super::surface::{select_all_key, AutomationSurface};
use crate::mcp::{ConnectionStatus, ProtocolClient};

pub const DEFAULT_SCROLL_AMOUNT: f64 = 400.0;
pub const SNAPSHOT_TOOL: &str = "take_snapshot";

fn default_scroll_amount() -> f64 {
    DEFAULT_SCROLL_AMOUNT
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    /// Signed wheel delta `(dx, dy)` for a scroll of `amount` pixels.
    pub fn delta(self, amount: f64) -> (f64, f64) {
        match self {
            ScrollDirection::Up => (0.0, -amount),
            ScrollDirection::Down => (0.0, amount),
            ScrollDirection::Left => (-amount, 0.0),
            ScrollDirection::Right => (amount, 0.0),
        }
    }
}

/// A point in the normalized 0–1000 space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    fn scale(self, viewport: &Viewport) -> (f64, f64) {
        viewport.to_pixels(self.x, self.y)
    }
}

/// Every action the router accepts, as parsed from `{"action": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BrowserAction {
    Navigate {
        url: String,
    },
    ClickAt {
        x: f64,
        y: f64,
    },
    HoverAt {
        x: f64,
        y: f64,
    },
    TypeTextAt {
        x: f64,
        y: f64,
        text: String,
        #[serde(default)]
        press_enter: bool,
        #[serde(default = "default_true")]
        clear_before_typing: bool,
    },
    DragAndDrop {
        x: f64,
        y: f64,
        destination_x: f64,
        destination_y: f64,
    },
    ScrollDocument {
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: f64,
    },
    ScrollAt {
        x: f64,
        y: f64,
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        magnitude: f64,
    },
    KeyCombination {
        keys: String,
    },
    GoBack,
    GoForward,
    EvaluateScript {
        code: String,
    },
    TakeSnapshot,
    CallProtocolTool {
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectAction {
    Navigate(String),
    ClickAt(Point),
    HoverAt(Point),
    TypeTextAt {
        at: Point,
        text: String,
        press_enter: bool,
        clear_before_typing: bool,
    },
    DragAndDrop {
        from: Point,
        to: Point,
    },
    ScrollDocument {
        direction: ScrollDirection,
        amount: f64,
    },
    ScrollAt {
        at: Point,
        direction: ScrollDirection,
        magnitude: f64,
    },
    KeyCombination(String),
    GoBack,
    GoForward,
    EvaluateScript(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolAction {
    TakeSnapshot,
    CallTool { name: String, arguments: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Direct(DirectAction),
    Protocol(ProtocolAction),
}

impl BrowserAction {
    pub fn name(&self) -> &'static str {
        match self {
            BrowserAction::Navigate { .. } => "navigate",
            BrowserAction::ClickAt { .. } => "click_at",
            BrowserAction::HoverAt { .. } => "hover_at",
            BrowserAction::TypeTextAt { .. } => "type_text_at",
            BrowserAction::DragAndDrop { .. } => "drag_and_drop",
            BrowserAction::ScrollDocument { .. } => "scroll_document",
            BrowserAction::ScrollAt { .. } => "scroll_at",
            BrowserAction::KeyCombination { .. } => "key_combination",
            BrowserAction::GoBack => "go_back",
            BrowserAction::GoForward => "go_forward",
            BrowserAction::EvaluateScript { .. } => "evaluate_script",
            BrowserAction::TakeSnapshot => "take_snapshot",
            BrowserAction::CallProtocolTool { .. } => "call_protocol_tool",
        }
    }

    pub fn route(self) -> Route {
        use BrowserAction as A;
        match self {
            A::Navigate { url } => Route::Direct(DirectAction::Navigate(url)),
            A::ClickAt { x, y } => Route::Direct(DirectAction::ClickAt(Point { x, y })),
            A::HoverAt { x, y } => Route::Direct(DirectAction::HoverAt(Point { x, y })),
            A::TypeTextAt {
                x,
                y,
                text,
                press_enter,
                clear_before_typing,
            } => Route::Direct(DirectAction::TypeTextAt {
                at: Point { x, y },
                text,
                press_enter,
                clear_before_typing,
            }),
            A::DragAndDrop {
                x,
                y,
                destination_x,
                destination_y,
            } => Route::Direct(DirectAction::DragAndDrop {
                from: Point { x, y },
                to: Point {
                    x: destination_x,
                    y: destination_y,
                },
            }),
            A::ScrollDocument { direction, amount } => {
                Route::Direct(DirectAction::ScrollDocument { direction, amount })
            }
            A::ScrollAt {
                x,
                y,
                direction,
                magnitude,
            } => Route::Direct(DirectAction::ScrollAt {
                at: Point { x, y },
                direction,
                magnitude,
            }),
            A::KeyCombination { keys } => Route::Direct(DirectAction::KeyCombination(keys)),
            A::GoBack => Route::Direct(DirectAction::GoBack),
            A::GoForward => Route::Direct(DirectAction::GoForward),
            A::EvaluateScript { code } => Route::Direct(DirectAction::EvaluateScript(code)),
            A::TakeSnapshot => Route::Protocol(ProtocolAction::TakeSnapshot),
            A::CallProtocolTool { name, arguments } => {
                Route::Protocol(ProtocolAction::CallTool { name, arguments })
            }
        }
    }
}

/// Result of one action. Only the fields the action produces are set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutput {
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

impl ActionOutput {
    pub fn done(action: &'static str) -> Self {
        Self {
            action,
            url: None,
            moved: None,
            output: None,
            snapshot: None,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "action": self.action }))
    }
}

/// Wrap a script body so top-level `return` and `await` are legal.
pub fn wrap_script(code: &str) -> String {
    format!("(async () => {{\n{}\n}})()", code)
}

async fn click_at(surface: &dyn AutomationSurface, x: f64, y: f64) -> BrowserResult<()> {
    surface.mouse_move(x, y, 1).await?;
    surface.mouse_down().await?;
    surface.mouse_up().await
}

impl DirectAction {
    pub fn name(&self) -> &'static str {
        match self {
            DirectAction::Navigate(_) => "navigate",
            DirectAction::ClickAt(_) => "click_at",
            DirectAction::HoverAt(_) => "hover_at",
            DirectAction::TypeTextAt { .. } => "type_text_at",
            DirectAction::DragAndDrop { .. } => "drag_and_drop",
            DirectAction::ScrollDocument { .. } => "scroll_document",
            DirectAction::ScrollAt { .. } => "scroll_at",
            DirectAction::KeyCombination(_) => "key_combination",
            DirectAction::GoBack => "go_back",
            DirectAction::GoForward => "go_forward",
            DirectAction::EvaluateScript(_) => "evaluate_script",
        }
    }

    /// Run against the direct surface. Pointer actions read the live
    /// viewport first; drags interpolate over `drag_steps` moves.
    pub async fn execute(
        &self,
        surface: &dyn AutomationSurface,
        drag_steps: u32,
    ) -> BrowserResult<ActionOutput> {
        let name = self.name();
        let mut out = ActionOutput::done(name);

        match self {
            DirectAction::Navigate(url) => {
                surface.navigate(url).await?;
                out.url = Some(surface.current_url().await?);
            }
            DirectAction::ClickAt(at) => {
                let (x, y) = at.scale(&surface.viewport_size().await?);
                debug!(x, y, "click_at");
                click_at(surface, x, y).await?;
            }
            DirectAction::HoverAt(at) => {
                let (x, y) = at.scale(&surface.viewport_size().await?);
                surface.mouse_move(x, y, 1).await?;
            }
            DirectAction::TypeTextAt {
                at,
                text,
                press_enter,
                clear_before_typing,
            } => {
                let (x, y) = at.scale(&surface.viewport_size().await?);
                click_at(surface, x, y).await?;
                if *clear_before_typing {
                    surface.keyboard_press(select_all_key()).await?;
                    surface.keyboard_press("Delete").await?;
                }
                surface.keyboard_type(text).await?;
                if *press_enter {
                    surface.keyboard_press("Enter").await?;
                }
            }
            DirectAction::DragAndDrop { from, to } => {
                let viewport = surface.viewport_size().await?;
                let (sx, sy) = from.scale(&viewport);
                let (dx, dy) = to.scale(&viewport);
                debug!(sx, sy, dx, dy, steps = drag_steps, "drag_and_drop");
                surface.mouse_move(sx, sy, 1).await?;
                surface.mouse_down().await?;
                surface.mouse_move(dx, dy, drag_steps.max(1)).await?;
                surface.mouse_up().await?;
            }
            DirectAction::ScrollDocument { direction, amount } => {
                let (cx, cy) = surface.viewport_size().await?.center();
                surface.mouse_move(cx, cy, 1).await?;
                let (dx, dy) = direction.delta(*amount);
                surface.mouse_wheel(dx, dy).await?;
            }
            DirectAction::ScrollAt {
                at,
                direction,
                magnitude,
            } => {
                let (x, y) = at.scale(&surface.viewport_size().await?);
                surface.mouse_move(x, y, 1).await?;
                let (dx, dy) = direction.delta(*magnitude);
                surface.mouse_wheel(dx, dy).await?;
            }
            DirectAction::KeyCombination(keys) => {
                surface.keyboard_press(keys).await?;
            }
            DirectAction::GoBack => {
                out.moved = Some(surface.go_back().await?);
                out.url = Some(surface.current_url().await?);
            }
            DirectAction::GoForward => {
                out.moved = Some(surface.go_forward().await?);
                out.url = Some(surface.current_url().await?);
            }
            DirectAction::EvaluateScript(code) => {
                out.output = Some(surface.evaluate(&wrap_script(code)).await?);
            }
        }

        Ok(out)
    }
}

impl ProtocolAction {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolAction::TakeSnapshot => "take_snapshot",
            ProtocolAction::CallTool { .. } => "call_protocol_tool",
        }
    }

    pub async fn execute(&self, client: &dyn ProtocolClient) -> BrowserResult<ActionOutput> {
        let mut out = ActionOutput::done(self.name());
        match self {
            ProtocolAction::TakeSnapshot => {
                let raw = call(client, SNAPSHOT_TOOL, json!({})).await?;
                out.snapshot = Some(Snapshot::from_tool_output(&raw));
            }
            ProtocolAction::CallTool { name, arguments } => {
                let arguments = if arguments.is_null() {
                    json!({})
                } else {
                    arguments.clone()
                };
                out.output = Some(call(client, name, arguments).await?);
            }
        }
        Ok(out)
    }
}

/// Call a server tool; a failure with the client no longer connected is a
/// disconnect, anything else is a protocol error.
async fn call(client: &dyn ProtocolClient, name: &str, arguments: Value) -> BrowserResult<Value> {
    client.call_tool(name, arguments).await.map_err(|e| {
        if client.status() == ConnectionStatus::Connected {
            BrowserError::Protocol(e.to_string())
        } else {
            BrowserError::Disconnected(e.to_string())
        }
    })
}
