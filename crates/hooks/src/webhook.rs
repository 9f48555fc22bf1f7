//! Posts tool-call lifecycle events to an HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use pilotdeck_core::config::ObservabilityConfig;
use pilotdeck_core::{Error, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::correlator::{CorrelationCallbacks, ToolCallFinished, ToolCallStarted};

pub struct WebhookSignal {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookSignal {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Hook(format!("webhook client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }

    /// Build a signal from config, or `None` when no webhook URL is configured.
    pub fn from_config(config: &ObservabilityConfig) -> Result<Option<Self>> {
        let Some(url) = config
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
        else {
            return Ok(None);
        };
        Self::new(
            url,
            config.webhook_token.clone(),
            Duration::from_secs(config.webhook_timeout_secs),
        )
        .map(Some)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Correlator callbacks that forward both lifecycle events to this webhook.
    pub fn callbacks(self: Arc<Self>) -> CorrelationCallbacks {
        let before = self.clone();
        let after = self;
        CorrelationCallbacks::new()
            .on_before_tool(move |event| {
                let signal = before.clone();
                async move { signal.post(started_payload(&event)).await }
            })
            .on_after_tool(move |event| {
                let signal = after.clone();
                async move { signal.post(finished_payload(&event)).await }
            })
    }

    async fn post(&self, body: Value) -> Result<()> {
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req
            .send()
            .await
            .map_err(|e| Error::Hook(format!("webhook failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Hook(format!("webhook error {}: {}", status, text)));
        }
        debug!(url = %self.url, event = %body["event"], "Tool-call signal delivered");
        Ok(())
    }
}

fn started_payload(event: &ToolCallStarted) -> Value {
    json!({
        "event": "tool_call.started",
        "callId": event.call_id,
        "toolName": event.tool_name,
        "input": event.input,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

fn finished_payload(event: &ToolCallFinished) -> Value {
    json!({
        "event": "tool_call.finished",
        "callId": event.call_id,
        "toolName": event.tool_name,
        "input": event.input,
        "response": event.response,
        "success": event.success,
        "correlated": event.correlated,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_without_url() {
        let cfg = ObservabilityConfig {
            webhook_url: Some("   ".into()),
            ..Default::default()
        };
        assert!(WebhookSignal::from_config(&cfg).unwrap().is_none());
    }

    #[test]
    fn test_from_config_with_url() {
        let cfg = ObservabilityConfig {
            webhook_url: Some(" http://127.0.0.1:9/hook ".into()),
            ..Default::default()
        };
        let signal = WebhookSignal::from_config(&cfg).unwrap().unwrap();
        assert_eq!(signal.url(), "http://127.0.0.1:9/hook");
    }

    #[test]
    fn test_payload_shapes() {
        let started = started_payload(&ToolCallStarted {
            call_id: "navigate-1-1".into(),
            tool_name: "navigate".into(),
            input: json!({"url": "https://a.test"}),
        });
        assert_eq!(started["event"], "tool_call.started");
        assert_eq!(started["callId"], "navigate-1-1");

        let finished = finished_payload(&ToolCallFinished {
            call_id: "navigate-1-1".into(),
            tool_name: "navigate".into(),
            input: json!({}),
            response: json!({"error": "x"}),
            success: false,
            correlated: true,
        });
        assert_eq!(finished["event"], "tool_call.finished");
        assert_eq!(finished["success"], false);
        assert_eq!(finished["correlated"], true);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_an_error() {
        let signal = WebhookSignal::new("http://127.0.0.1:9/hook", None, Duration::from_millis(500)).unwrap();
        assert!(signal.post(json!({"event": "x"})).await.is_err());
    }
}
