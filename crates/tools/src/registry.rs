use std::collections::HashMap;
use std::sync::Arc;

use pilotdeck_core::{Error, Result};
use pilotdeck_hooks::{ToolEventContext, ToolEventHooks};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{Tool, ToolContext};

/// Named tools plus the hook slot fired around every execution.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    hooks: Option<Arc<dyn ToolEventHooks>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_hooks(mut self, hooks: Arc<dyn ToolEventHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// The mutable hook slot, present only once hooks have been attached.
    pub fn event_hooks_mut(&mut self) -> Option<&mut Arc<dyn ToolEventHooks>> {
        self.hooks.as_mut()
    }

    pub fn has_event_hooks(&self) -> bool {
        self.hooks.is_some()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        debug!(name = schema.name, "Registering tool");
        self.tools.insert(schema.name.to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn get_tool_schemas(&self) -> Vec<Value> {
        let mut schemas: Vec<(&str, Value)> = self
            .tools
            .values()
            .map(|tool| {
                let schema = tool.schema();
                (
                    schema.name,
                    json!({
                        "type": "function",
                        "function": {
                            "name": schema.name,
                            "description": schema.description,
                            "parameters": schema.parameters
                        }
                    }),
                )
            })
            .collect();
        schemas.sort_by(|a, b| a.0.cmp(b.0));
        schemas.into_iter().map(|(_, v)| v).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate and run a tool, firing before/after events on the hook slot.
    ///
    /// Hook failures are logged and never change the tool's own result.
    /// A tool error is still reported to the after event as `{"error": ...}`.
    pub async fn execute(&self, name: &str, ctx: ToolContext, params: Value) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::Tool(format!("Unknown tool: {}", name)))?;

        if let Err(e) = tool.validate(&params) {
            warn!(tool = name, error = %e, "Tool validation failed");
            return Err(e);
        }

        let event_ctx = ToolEventContext {
            session_key: ctx.session_key.clone(),
        };

        if let Some(hooks) = &self.hooks {
            match hooks.fire_before_tool(name, &params, Some(&event_ctx)).await {
                Ok(v) if !v.is_null() => debug!(tool = name, result = %v, "before_tool hook"),
                Ok(_) => {}
                Err(e) => warn!(tool = name, error = %e, "before_tool hook failed"),
            }
        }

        debug!(tool = name, "Executing tool");
        let result = tool.execute(ctx, params.clone()).await;

        if let Some(hooks) = &self.hooks {
            let response = match &result {
                Ok(v) => v.clone(),
                Err(e) => json!({ "error": e.to_string() }),
            };
            match hooks
                .fire_after_tool(name, &params, &response, Some(&event_ctx))
                .await
            {
                Ok(v) if !v.is_null() => debug!(tool = name, result = %v, "after_tool hook"),
                Ok(_) => {}
                Err(e) => warn!(tool = name, error = %e, "after_tool hook failed"),
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn schema(&self) -> crate::ToolSchema {
            crate::ToolSchema {
                name: "echo",
                description: "Echo params back",
                parameters: json!({"type": "object"}),
            }
        }

        fn validate(&self, params: &Value) -> Result<()> {
            if params.get("fail_validation").is_some() {
                return Err(Error::Tool("bad params".into()));
            }
            Ok(())
        }

        async fn execute(&self, _ctx: ToolContext, params: Value) -> Result<Value> {
            if params.get("boom").is_some() {
                return Err(Error::Tool("boom".into()));
            }
            Ok(params)
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<(String, String, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl ToolEventHooks for RecordingHooks {
        async fn fire_before_tool(
            &self,
            tool_name: &str,
            _input: &Value,
            ctx: Option<&ToolEventContext>,
        ) -> Result<Value> {
            self.events.lock().unwrap().push((
                "before".into(),
                tool_name.into(),
                json!(ctx.map(|c| c.session_key.clone())),
            ));
            if self.fail {
                return Err(Error::Hook("hook down".into()));
            }
            Ok(Value::Null)
        }

        async fn fire_after_tool(
            &self,
            tool_name: &str,
            _input: &Value,
            response: &Value,
            _ctx: Option<&ToolEventContext>,
        ) -> Result<Value> {
            self.events
                .lock()
                .unwrap()
                .push(("after".into(), tool_name.into(), response.clone()));
            if self.fail {
                return Err(Error::Hook("hook down".into()));
            }
            Ok(Value::Null)
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("cli:test")
    }

    #[test]
    fn test_registry_new_empty() {
        let reg = ToolRegistry::new();
        assert!(reg.tool_names().is_empty());
        assert!(reg.get("echo").is_none());
        assert!(!reg.has_event_hooks());
    }

    #[test]
    fn test_register_and_schemas() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        assert_eq!(reg.tool_names(), vec!["echo".to_string()]);
        let schemas = reg.get_tool_schemas();
        assert_eq!(schemas[0]["function"]["name"], "echo");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let reg = ToolRegistry::new();
        assert!(reg.execute("nope", ctx(), json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_fires_hooks_around_tool() {
        let hooks = Arc::new(RecordingHooks::default());
        let mut reg = ToolRegistry::new().with_event_hooks(hooks.clone());
        reg.register(Arc::new(EchoTool));

        let out = reg.execute("echo", ctx(), json!({"a": 1})).await.unwrap();
        assert_eq!(out, json!({"a": 1}));

        let events = hooks.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "before");
        assert_eq!(events[0].2, json!("cli:test"));
        assert_eq!(events[1].0, "after");
        assert_eq!(events[1].2, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_tool_error_reported_to_after_hook() {
        let hooks = Arc::new(RecordingHooks::default());
        let mut reg = ToolRegistry::new().with_event_hooks(hooks.clone());
        reg.register(Arc::new(EchoTool));

        assert!(reg.execute("echo", ctx(), json!({"boom": true})).await.is_err());
        let events = hooks.events.lock().unwrap();
        assert!(events[1].2["error"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_validation_failure_skips_hooks() {
        let hooks = Arc::new(RecordingHooks::default());
        let mut reg = ToolRegistry::new().with_event_hooks(hooks.clone());
        reg.register(Arc::new(EchoTool));

        assert!(reg
            .execute("echo", ctx(), json!({"fail_validation": true}))
            .await
            .is_err());
        assert!(hooks.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hook_errors_do_not_fail_tool() {
        let hooks = Arc::new(RecordingHooks {
            fail: true,
            ..Default::default()
        });
        let mut reg = ToolRegistry::new().with_event_hooks(hooks);
        reg.register(Arc::new(EchoTool));

        let out = reg.execute("echo", ctx(), json!({"a": 2})).await.unwrap();
        assert_eq!(out["a"], 2);
    }

    #[test]
    fn test_event_hooks_slot() {
        let mut reg = ToolRegistry::new();
        assert!(reg.event_hooks_mut().is_none());
        let mut reg = reg.with_event_hooks(Arc::new(RecordingHooks::default()));
        assert!(reg.event_hooks_mut().is_some());
    }
}
