use async_trait::async_trait;
use pilotdeck_core::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::action::BrowserAction;
use super::router::BrowserRouter;
use crate::{Tool, ToolContext, ToolSchema};

/// Exposes the browser router as the `browser` tool.
pub struct BrowserTool {
    router: Arc<BrowserRouter>,
}

impl BrowserTool {
    pub fn new(router: Arc<BrowserRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<BrowserRouter> {
        &self.router
    }
}

fn parse_action(params: &Value) -> Result<BrowserAction> {
    if params.get("action").and_then(|v| v.as_str()).is_none() {
        return Err(Error::Tool("Missing required parameter: action".into()));
    }
    serde_json::from_value(params.clone())
        .map_err(|e| Error::Tool(format!("Invalid browser action: {}", e)))
}

#[async_trait]
impl Tool for BrowserTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "browser",
            description: "Control a shared browser. Coordinates are normalized to 0-1000 on both axes and scaled to the viewport. 'take_snapshot' returns the page's accessibility tree with element uids; 'evaluate_script' runs code as the body of an async function and returns its value.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": [
                            "navigate", "click_at", "hover_at", "type_text_at",
                            "drag_and_drop", "scroll_document", "scroll_at",
                            "key_combination", "go_back", "go_forward",
                            "evaluate_script", "take_snapshot", "call_protocol_tool"
                        ],
                        "description": "Browser action. ALWAYS specify action explicitly."
                    },
                    "url": { "type": "string", "description": "URL for 'navigate'" },
                    "x": { "type": "number", "description": "Normalized x (0-1000)" },
                    "y": { "type": "number", "description": "Normalized y (0-1000)" },
                    "destination_x": { "type": "number", "description": "Drop target x for 'drag_and_drop'" },
                    "destination_y": { "type": "number", "description": "Drop target y for 'drag_and_drop'" },
                    "text": { "type": "string", "description": "Text for 'type_text_at'" },
                    "press_enter": { "type": "boolean", "description": "Press Enter after typing (default: false)" },
                    "clear_before_typing": { "type": "boolean", "description": "Select all and delete before typing (default: true)" },
                    "direction": {
                        "type": "string",
                        "enum": ["up", "down", "left", "right"]
                    },
                    "amount": { "type": "number", "description": "Pixels for 'scroll_document' (default: 400)" },
                    "magnitude": { "type": "number", "description": "Pixels for 'scroll_at' (default: 400)" },
                    "keys": { "type": "string", "description": "Key combination, e.g. 'Control+A' or 'Enter'" },
                    "code": { "type": "string", "description": "Script body for 'evaluate_script'; use 'return' for the result" },
                    "name": { "type": "string", "description": "Inspection server tool for 'call_protocol_tool'" },
                    "arguments": { "type": "object", "description": "Arguments for 'call_protocol_tool'" }
                },
                "required": ["action"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        parse_action(params).map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        let action = parse_action(&params)?;
        debug!(session = %ctx.session_key, action = action.name(), "Browser action");
        let output = self.router.execute(action).await?;
        Ok(output.to_json())
    }
}
