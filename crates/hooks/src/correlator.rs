//! Before/after tool-call correlation.
//!
//! The correlator sits in front of an installed `ToolEventHooks`. Each before
//! event gets a fresh call id which is parked under a key derived from the tool
//! name and its input; the matching after event picks the id back up. Observer
//! callbacks run as detached tasks so they can never slow down, fail, or change
//! the result of the tool call they observe.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use pilotdeck_core::config::CorrelationConfig;
use pilotdeck_core::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::call_store::CallStore;
use crate::outcome::is_failure_response;
use crate::{ToolEventContext, ToolEventHooks};

static CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a process-unique call id: `{tool}-{unix millis}-{counter}`.
pub fn new_call_id(tool_name: &str) -> String {
    let n = CALL_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
    format!("{}-{}-{}", tool_name, chrono::Utc::now().timestamp_millis(), n)
}

/// Key linking a before event to its after event.
///
/// Object keys are sorted before serializing so field order never matters.
/// Input that cannot be serialized falls back to a timestamp key, which will
/// usually fail to match its after event.
pub fn correlation_key<T: Serialize + ?Sized>(tool_name: &str, input: &T) -> String {
    match serde_json::to_value(input).and_then(|v| serde_json::to_string(&canonical(v))) {
        Ok(serialized) => format!("{}:{}", tool_name, serialized),
        Err(e) => {
            debug!(tool = %tool_name, error = %e, "Tool input not serializable, using timestamp key");
            format!("{}:{}", tool_name, chrono::Utc::now().timestamp_millis())
        }
    }
}

fn canonical(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonical(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

/// Delivered to the before-tool observer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStarted {
    pub call_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Delivered to the after-tool observer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallFinished {
    pub call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub response: Value,
    pub success: bool,
    /// False when no before event was on record and the id was minted fresh.
    pub correlated: bool,
}

pub type BeforeToolCallback = Arc<dyn Fn(ToolCallStarted) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type AfterToolCallback = Arc<dyn Fn(ToolCallFinished) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Optional observers notified around each tool call.
#[derive(Clone, Default)]
pub struct CorrelationCallbacks {
    on_before_tool: Option<BeforeToolCallback>,
    on_after_tool: Option<AfterToolCallback>,
}

impl CorrelationCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_tool<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ToolCallStarted) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cb: BeforeToolCallback = Arc::new(move |event| f(event).boxed());
        self.on_before_tool = Some(cb);
        self
    }

    pub fn on_after_tool<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ToolCallFinished) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cb: AfterToolCallback = Arc::new(move |event| f(event).boxed());
        self.on_after_tool = Some(cb);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_before_tool.is_none() && self.on_after_tool.is_none()
    }
}

/// Count of observer tasks still running.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Held by a running observer task; the last one out wakes `drain`.
struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    async fn wait_idle(&self) {
        loop {
            // Register before checking so a wake between the two is not lost.
            let idle = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// `ToolEventHooks` wrapper that correlates before/after events.
pub struct ToolCallCorrelator {
    inner: Arc<dyn ToolEventHooks>,
    store: CallStore,
    callbacks: CorrelationCallbacks,
    in_flight: Arc<InFlight>,
}

impl ToolCallCorrelator {
    pub fn new(
        inner: Arc<dyn ToolEventHooks>,
        callbacks: CorrelationCallbacks,
        config: &CorrelationConfig,
    ) -> Self {
        Self {
            inner,
            store: CallStore::new(config.max_entries, Duration::from_secs(config.ttl_secs)),
            callbacks,
            in_flight: Arc::default(),
        }
    }

    /// Call records still waiting for their after event.
    pub fn pending_calls(&self) -> usize {
        self.store.len()
    }

    /// Wait for running observer callbacks, giving up after `timeout`.
    ///
    /// Returns `true` if every callback finished in time. Meant for process
    /// exit, so a short-lived command does not drop its last notifications.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let running = self.in_flight.count.load(Ordering::SeqCst);
        if running == 0 {
            return true;
        }
        debug!(running, "Waiting for tool-call callbacks");
        tokio::time::timeout(timeout, self.in_flight.wait_idle())
            .await
            .is_ok()
    }
}

#[async_trait]
impl ToolEventHooks for ToolCallCorrelator {
    async fn fire_before_tool(
        &self,
        tool_name: &str,
        input: &Value,
        ctx: Option<&ToolEventContext>,
    ) -> Result<Value> {
        let key = correlation_key(tool_name, input);
        let call_id = new_call_id(tool_name);
        self.store.insert(key, call_id.clone());
        debug!(tool = %tool_name, call_id = %call_id, "Tool call started");

        if let Some(cb) = self.callbacks.on_before_tool.clone() {
            let event = ToolCallStarted {
                call_id,
                tool_name: tool_name.to_string(),
                input: input.clone(),
            };
            self.detach("before", tool_name, move || cb(event));
        }

        self.inner.fire_before_tool(tool_name, input, ctx).await
    }

    async fn fire_after_tool(
        &self,
        tool_name: &str,
        input: &Value,
        response: &Value,
        ctx: Option<&ToolEventContext>,
    ) -> Result<Value> {
        let key = correlation_key(tool_name, input);
        let (call_id, correlated) = match self.store.take(&key) {
            Some(id) => (id, true),
            None => {
                debug!(tool = %tool_name, "No before record for tool call, minting uncorrelated id");
                (new_call_id(tool_name), false)
            }
        };
        let success = !is_failure_response(response);
        debug!(tool = %tool_name, call_id = %call_id, success, "Tool call finished");

        if let Some(cb) = self.callbacks.on_after_tool.clone() {
            let event = ToolCallFinished {
                call_id,
                tool_name: tool_name.to_string(),
                input: input.clone(),
                response: response.clone(),
                success,
                correlated,
            };
            self.detach("after", tool_name, move || cb(event));
        }

        self.inner.fire_after_tool(tool_name, input, response, ctx).await
    }
}

impl ToolCallCorrelator {
    /// Run an observer callback on its own task. Errors and panics are logged, never returned.
    fn detach<F>(&self, phase: &'static str, tool_name: &str, make: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(tool = %tool_name, phase, "No async runtime, dropping tool-call callback");
            return;
        };
        let tool = tool_name.to_string();
        let guard = self.in_flight.enter();
        // `make` runs inside the task so a synchronous panic is caught as well.
        handle.spawn(async move {
            let _guard = guard;
            match AssertUnwindSafe(async move { make().await }).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(tool = %tool, phase, error = %e, "Tool-call callback failed"),
                Err(_) => warn!(tool = %tool, phase, "Tool-call callback panicked"),
            }
        });
    }
}

/// Wrap the hook mechanism in `slot` with a correlator.
///
/// Returns the installed correlator, or `None` (after logging a warning) when
/// there is no mechanism to wrap.
pub fn install_tool_correlation(
    slot: Option<&mut Arc<dyn ToolEventHooks>>,
    callbacks: CorrelationCallbacks,
    config: &CorrelationConfig,
) -> Option<Arc<ToolCallCorrelator>> {
    let Some(slot) = slot else {
        warn!("No tool event hooks available, tool-call correlation not installed");
        return None;
    };
    let correlator = Arc::new(ToolCallCorrelator::new(slot.clone(), callbacks, config));
    *slot = correlator.clone();
    debug!("Tool-call correlation installed");
    Some(correlator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopToolEvents;
    use pilotdeck_core::Error;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Inner hooks that echo their arguments and count calls.
    #[derive(Default)]
    struct RecordingHooks {
        before: Mutex<Vec<String>>,
        after: Mutex<Vec<String>>,
        fail_after: bool,
    }

    #[async_trait]
    impl ToolEventHooks for RecordingHooks {
        async fn fire_before_tool(
            &self,
            tool_name: &str,
            input: &Value,
            _ctx: Option<&ToolEventContext>,
        ) -> Result<Value> {
            self.before.lock().unwrap().push(tool_name.to_string());
            Ok(json!({"phase": "before", "tool": tool_name, "input": input}))
        }

        async fn fire_after_tool(
            &self,
            tool_name: &str,
            _input: &Value,
            response: &Value,
            _ctx: Option<&ToolEventContext>,
        ) -> Result<Value> {
            self.after.lock().unwrap().push(tool_name.to_string());
            if self.fail_after {
                return Err(Error::Hook("after hook rejected".into()));
            }
            Ok(json!({"phase": "after", "response": response}))
        }
    }

    fn config() -> CorrelationConfig {
        CorrelationConfig::default()
    }

    fn channel_callbacks() -> (
        CorrelationCallbacks,
        mpsc::UnboundedReceiver<ToolCallStarted>,
        mpsc::UnboundedReceiver<ToolCallFinished>,
    ) {
        let (btx, brx) = mpsc::unbounded_channel();
        let (atx, arx) = mpsc::unbounded_channel();
        let callbacks = CorrelationCallbacks::new()
            .on_before_tool(move |e| {
                let tx = btx.clone();
                async move {
                    let _ = tx.send(e);
                    Ok::<(), Error>(())
                }
            })
            .on_after_tool(move |e| {
                let tx = atx.clone();
                async move {
                    let _ = tx.send(e);
                    Ok::<(), Error>(())
                }
            });
        (callbacks, brx, arx)
    }

    #[test]
    fn test_key_ignores_field_order() {
        let a = json!({"url": "https://x", "opts": {"b": 1, "a": 2}});
        let b: Value = serde_json::from_str(r#"{"opts": {"a": 2, "b": 1}, "url": "https://x"}"#).unwrap();
        assert_eq!(correlation_key("navigate", &a), correlation_key("navigate", &b));
        assert!(correlation_key("navigate", &a).starts_with("navigate:{"));
        assert_ne!(correlation_key("navigate", &a), correlation_key("click", &a));
    }

    #[test]
    fn test_key_falls_back_for_unserializable_input() {
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);
        let key = correlation_key("grid", &bad);
        let suffix = key.strip_prefix("grid:").unwrap();
        assert!(suffix.parse::<i64>().is_ok(), "expected timestamp suffix, got {}", key);
    }

    #[test]
    fn test_call_ids_are_unique_and_well_formed() {
        let a = new_call_id("click_at");
        let b = new_call_id("click_at");
        assert_ne!(a, b);
        let parts: Vec<&str> = a.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2], "click_at");
        assert!(parts[1].parse::<i64>().is_ok());
        assert!(parts[0].parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_before_and_after_share_call_id() {
        let (callbacks, mut brx, mut arx) = channel_callbacks();
        let c = ToolCallCorrelator::new(Arc::new(NoopToolEvents), callbacks, &config());
        let input = json!({"x": 500, "y": 500});

        c.fire_before_tool("click_at", &input, None).await.unwrap();
        assert_eq!(c.pending_calls(), 1);
        c.fire_after_tool("click_at", &input, &json!({"status": "clicked"}), None)
            .await
            .unwrap();
        assert_eq!(c.pending_calls(), 0);

        let started = brx.recv().await.unwrap();
        let finished = arx.recv().await.unwrap();
        assert_eq!(started.call_id, finished.call_id);
        assert!(finished.success);
        assert!(finished.correlated);
    }

    #[tokio::test]
    async fn test_interleaved_distinct_calls_do_not_cross() {
        let (callbacks, mut brx, mut arx) = channel_callbacks();
        let c = ToolCallCorrelator::new(Arc::new(NoopToolEvents), callbacks, &config());
        let nav = json!({"url": "https://a.test"});
        let click = json!({"x": 1, "y": 2});

        c.fire_before_tool("navigate", &nav, None).await.unwrap();
        c.fire_before_tool("click_at", &click, None).await.unwrap();
        c.fire_after_tool("click_at", &click, &json!({"error": "boom"}), None).await.unwrap();
        c.fire_after_tool("navigate", &nav, &Value::Null, None).await.unwrap();

        let mut started = HashMap::new();
        for _ in 0..2 {
            let e = brx.recv().await.unwrap();
            started.insert(e.tool_name.clone(), e.call_id);
        }
        for _ in 0..2 {
            let e = arx.recv().await.unwrap();
            assert_eq!(started[&e.tool_name], e.call_id);
            assert_eq!(e.success, e.tool_name == "navigate");
        }
    }

    #[tokio::test]
    async fn test_unmatched_after_gets_fresh_id() {
        let (callbacks, _brx, mut arx) = channel_callbacks();
        let c = ToolCallCorrelator::new(Arc::new(NoopToolEvents), callbacks, &config());

        let result = c
            .fire_after_tool("snapshot", &json!({}), &json!({"isError": true}), None)
            .await;
        assert!(result.is_ok());

        let finished = arx.recv().await.unwrap();
        assert!(finished.call_id.starts_with("snapshot-"));
        assert!(!finished.correlated);
        assert!(!finished.success);
    }

    #[tokio::test]
    async fn test_inner_results_pass_through_unchanged() {
        let inner = Arc::new(RecordingHooks {
            fail_after: true,
            ..Default::default()
        });
        let c = ToolCallCorrelator::new(inner.clone(), CorrelationCallbacks::new(), &config());
        let input = json!({"code": "return 1"});

        let before = c.fire_before_tool("evaluate", &input, None).await.unwrap();
        assert_eq!(before, json!({"phase": "before", "tool": "evaluate", "input": input}));

        let after = c.fire_after_tool("evaluate", &input, &json!({"output": 1}), None).await;
        match after {
            Err(Error::Hook(msg)) => assert_eq!(msg, "after hook rejected"),
            other => panic!("expected inner hook error, got {:?}", other),
        }
        assert_eq!(inner.before.lock().unwrap().len(), 1);
        assert_eq!(inner.after.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_callbacks_are_isolated() {
        let inner = Arc::new(RecordingHooks::default());
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let callbacks = CorrelationCallbacks::new()
            .on_before_tool(|_e| async move { Err::<(), _>(Error::Other("observer down".into())) })
            .on_after_tool(move |e| {
                let tx = tx.clone();
                if e.tool_name == "panics" {
                    panic!("observer panicked synchronously");
                }
                async move {
                    let _ = tx.send(e.call_id);
                    Ok::<(), Error>(())
                }
            });
        let c = ToolCallCorrelator::new(inner.clone(), callbacks, &config());

        let r1 = c.fire_before_tool("panics", &json!({}), None).await.unwrap();
        let r2 = c.fire_after_tool("panics", &json!({}), &Value::Null, None).await.unwrap();
        assert_eq!(r1["phase"], "before");
        assert_eq!(r2["phase"], "after");

        // Later invocations still go through.
        c.fire_before_tool("navigate", &json!({"url": "u"}), None).await.unwrap();
        c.fire_after_tool("navigate", &json!({"url": "u"}), &Value::Null, None).await.unwrap();
        let id = rx.recv().await.unwrap();
        assert!(id.starts_with("navigate-"));
        assert_eq!(inner.after.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_block_call() {
        let callbacks = CorrelationCallbacks::new().on_before_tool(|_e| async move {
            futures::future::pending::<()>().await;
            Ok::<(), Error>(())
        });
        let c = ToolCallCorrelator::new(Arc::new(NoopToolEvents), callbacks, &config());
        let r = tokio::time::timeout(
            Duration::from_secs(1),
            c.fire_before_tool("wait", &json!({}), None),
        )
        .await;
        assert!(r.is_ok());
    }

    #[tokio::test]
    async fn test_drain_waits_for_after_callback() {
        let delivered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = delivered.clone();
        let callbacks = CorrelationCallbacks::new().on_after_tool(move |_e| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<(), Error>(())
            }
        });
        let c = ToolCallCorrelator::new(Arc::new(NoopToolEvents), callbacks, &config());

        c.fire_after_tool("navigate", &json!({"url": "u"}), &Value::Null, None)
            .await
            .unwrap();
        assert!(!delivered.load(Ordering::SeqCst));

        assert!(c.drain(Duration::from_secs(5)).await);
        assert!(delivered.load(Ordering::SeqCst));
        assert_eq!(c.in_flight.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_stuck_callback() {
        let callbacks = CorrelationCallbacks::new()
            .on_before_tool(|_e| async move {
                futures::future::pending::<()>().await;
                Ok::<(), Error>(())
            })
            .on_after_tool(|_e| async move { Err::<(), _>(Error::Other("observer down".into())) });
        let c = ToolCallCorrelator::new(Arc::new(NoopToolEvents), callbacks, &config());
        assert!(c.drain(Duration::from_millis(10)).await);

        c.fire_before_tool("wait", &json!({}), None).await.unwrap();
        c.fire_after_tool("wait", &json!({}), &Value::Null, None).await.unwrap();
        assert!(!c.drain(Duration::from_millis(100)).await);
        // Only the stuck before callback is still counted.
        assert_eq!(c.in_flight.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_install_without_mechanism_is_noop() {
        let installed = install_tool_correlation(None, CorrelationCallbacks::new(), &config());
        assert!(installed.is_none());
    }

    #[tokio::test]
    async fn test_install_wraps_slot() {
        let inner = Arc::new(RecordingHooks::default());
        let mut slot: Arc<dyn ToolEventHooks> = inner.clone();
        let (callbacks, mut brx, _arx) = channel_callbacks();

        let correlator = install_tool_correlation(Some(&mut slot), callbacks, &config()).unwrap();
        slot.fire_before_tool("type_text_at", &json!({"text": "hi"}), None)
            .await
            .unwrap();

        assert_eq!(correlator.pending_calls(), 1);
        assert_eq!(*inner.before.lock().unwrap(), vec!["type_text_at".to_string()]);
        assert!(brx.recv().await.unwrap().call_id.starts_with("type_text_at-"));
    }
}
