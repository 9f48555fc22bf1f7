//! Shell-command hook mechanism.
//!
//! Each configured command is run through `sh -c` with a JSON event on stdin.
//! Stdout is parsed as JSON when possible and returned as the hook result.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use pilotdeck_core::config::HooksConfig;
use pilotdeck_core::Result;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{ToolEventContext, ToolEventHooks};

const MAX_OUTPUT_CHARS: usize = 10_000;

pub struct CommandToolEvents {
    before_tool: Vec<String>,
    after_tool: Vec<String>,
    timeout: Duration,
}

impl CommandToolEvents {
    pub fn new(before_tool: Vec<String>, after_tool: Vec<String>, timeout: Duration) -> Self {
        Self {
            before_tool,
            after_tool,
            timeout,
        }
    }

    pub fn from_config(config: &HooksConfig) -> Self {
        Self::new(
            config.before_tool.clone(),
            config.after_tool.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    async fn run_all(&self, commands: &[String], event: &Value) -> Value {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            results.push(self.run_one(command, event).await);
        }
        match results.len() {
            0 => Value::Null,
            1 => results.pop().unwrap_or(Value::Null),
            _ => Value::Array(results),
        }
    }

    async fn run_one(&self, command: &str, event: &Value) -> Value {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(command, error = %e, "Failed to spawn hook command");
                return json!({"command": command, "error": format!("spawn failed: {}", e)});
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let payload = event.to_string();
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!(command, error = %e, "Hook command closed stdin early");
            }
        }

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stdout = stdout.trim();
                if !output.status.success() {
                    warn!(command, code = ?output.status.code(), "Hook command exited with failure");
                }
                if stdout.is_empty() {
                    return Value::Null;
                }
                serde_json::from_str(stdout)
                    .unwrap_or_else(|_| Value::String(truncate(stdout, MAX_OUTPUT_CHARS)))
            }
            Ok(Err(e)) => {
                warn!(command, error = %e, "Hook command failed");
                json!({"command": command, "error": e.to_string()})
            }
            Err(_) => {
                warn!(command, timeout_secs = self.timeout.as_secs(), "Hook command timed out");
                json!({"command": command, "error": "timed out"})
            }
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{}...", head)
}

#[async_trait]
impl ToolEventHooks for CommandToolEvents {
    async fn fire_before_tool(
        &self,
        tool_name: &str,
        input: &Value,
        ctx: Option<&ToolEventContext>,
    ) -> Result<Value> {
        if self.before_tool.is_empty() {
            return Ok(Value::Null);
        }
        let event = json!({
            "event": "before_tool",
            "toolName": tool_name,
            "input": input,
            "sessionKey": ctx.map(|c| c.session_key.as_str()),
        });
        Ok(self.run_all(&self.before_tool, &event).await)
    }

    async fn fire_after_tool(
        &self,
        tool_name: &str,
        input: &Value,
        response: &Value,
        ctx: Option<&ToolEventContext>,
    ) -> Result<Value> {
        if self.after_tool.is_empty() {
            return Ok(Value::Null);
        }
        let event = json!({
            "event": "after_tool",
            "toolName": tool_name,
            "input": input,
            "response": response,
            "sessionKey": ctx.map(|c| c.session_key.as_str()),
        });
        Ok(self.run_all(&self.after_tool, &event).await)
    }
}
