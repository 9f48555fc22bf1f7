//! Tool-call lifecycle hooks.
//!
//! `ToolEventHooks` is the before/after firing mechanism the tool registry calls
//! around every tool execution. The correlator wraps an installed mechanism and
//! gives each invocation one call id that external observers can follow.

pub mod call_store;
pub mod command;
pub mod correlator;
pub mod outcome;
pub mod webhook;

use async_trait::async_trait;
use pilotdeck_core::Result;
use serde::Serialize;
use serde_json::Value;

pub use call_store::CallStore;
pub use command::CommandToolEvents;
pub use correlator::{
    correlation_key, install_tool_correlation, new_call_id, CorrelationCallbacks,
    ToolCallCorrelator, ToolCallFinished, ToolCallStarted,
};
pub use outcome::is_failure_response;
pub use webhook::WebhookSignal;

/// Per-call context forwarded to hooks untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolEventContext {
    pub session_key: String,
}

#[async_trait]
pub trait ToolEventHooks: Send + Sync {
    async fn fire_before_tool(
        &self,
        tool_name: &str,
        input: &Value,
        ctx: Option<&ToolEventContext>,
    ) -> Result<Value>;

    async fn fire_after_tool(
        &self,
        tool_name: &str,
        input: &Value,
        response: &Value,
        ctx: Option<&ToolEventContext>,
    ) -> Result<Value>;
}

/// Hook mechanism that fires nothing. Lets the correlator run without command hooks.
pub struct NoopToolEvents;

#[async_trait]
impl ToolEventHooks for NoopToolEvents {
    async fn fire_before_tool(
        &self,
        _tool_name: &str,
        _input: &Value,
        _ctx: Option<&ToolEventContext>,
    ) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn fire_after_tool(
        &self,
        _tool_name: &str,
        _input: &Value,
        _response: &Value,
        _ctx: Option<&ToolEventContext>,
    ) -> Result<Value> {
        Ok(Value::Null)
    }
}
