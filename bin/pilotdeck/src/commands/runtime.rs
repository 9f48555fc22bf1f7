use pilotdeck_core::{Config, Error, Paths};
use pilotdeck_hooks::{
    install_tool_correlation, CommandToolEvents, CorrelationCallbacks, NoopToolEvents,
    ToolCallCorrelator, ToolCallFinished, ToolCallStarted, ToolEventHooks, WebhookSignal,
};
use pilotdeck_tools::browser::{BrowserRouter, BrowserTool};
use pilotdeck_tools::mcp::McpConnectionManager;
use pilotdeck_tools::{ToolContext, ToolRegistry};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything a CLI tool run needs: the registry with hooks and correlation
/// installed, and the browser router behind the `browser` tool.
pub struct Runtime {
    registry: ToolRegistry,
    router: Arc<BrowserRouter>,
    correlator: Option<Arc<ToolCallCorrelator>>,
    /// Upper bound on waiting for in-flight tool-call callbacks at exit.
    drain_timeout: Duration,
}

fn logging_callbacks() -> CorrelationCallbacks {
    CorrelationCallbacks::new()
        .on_before_tool(|event: ToolCallStarted| async move {
            info!(call_id = %event.call_id, tool = %event.tool_name, "Tool call started");
            Ok::<(), Error>(())
        })
        .on_after_tool(|event: ToolCallFinished| async move {
            info!(
                call_id = %event.call_id,
                tool = %event.tool_name,
                success = event.success,
                correlated = event.correlated,
                "Tool call finished"
            );
            Ok::<(), Error>(())
        })
}

impl Runtime {
    pub fn load() -> anyhow::Result<Self> {
        let paths = Paths::new();
        let config = Config::load_or_default(&paths)?;
        let callbacks = match WebhookSignal::from_config(&config.observability)? {
            Some(signal) => {
                info!(url = %signal.url(), "Forwarding tool-call events to webhook");
                Arc::new(signal).callbacks()
            }
            None => logging_callbacks(),
        };
        Ok(Self::assemble(&paths, &config, callbacks))
    }

    fn assemble(paths: &Paths, config: &Config, callbacks: CorrelationCallbacks) -> Self {
        let hooks: Arc<dyn ToolEventHooks> = if config.hooks.is_empty() {
            Arc::new(NoopToolEvents)
        } else {
            Arc::new(CommandToolEvents::from_config(&config.hooks))
        };
        let mut registry = ToolRegistry::new().with_event_hooks(hooks);
        let correlator =
            install_tool_correlation(registry.event_hooks_mut(), callbacks, &config.correlation);

        let manager = Arc::new(McpConnectionManager::new());
        let router = Arc::new(BrowserRouter::from_config(&config.browser, paths, manager));
        registry.register(Arc::new(BrowserTool::new(router.clone())));
        debug!(tools = ?registry.tool_names(), "Tool registry ready");

        Self {
            registry,
            router,
            correlator,
            drain_timeout: Duration::from_secs(config.observability.webhook_timeout_secs),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn run_tool(&self, name: &str, params: Value) -> anyhow::Result<Value> {
        let ctx = ToolContext::new("cli:run");
        Ok(self.registry.execute(name, ctx, params).await?)
    }

    /// Close the browser and the inspection server started by this run,
    /// then let pending tool-call callbacks (webhook posts) finish.
    pub async fn shutdown(&self) {
        self.router.close().await;
        if let Some(correlator) = &self.correlator {
            if !correlator.drain(self.drain_timeout).await {
                warn!(
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Tool-call callbacks still running at exit"
                );
            }
        }
    }
}
