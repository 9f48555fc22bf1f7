use serde_json::Value;

/// Heuristic failure check for tool responses seen by after-events.
///
/// A response counts as a failure when it is an object carrying any of:
/// a non-null `error`, `isError: true`, `success: false`, or a string
/// `message` containing "error" in any case. Anything else, `null` included,
/// is a success. The check is deliberately loose and misses failures that
/// report themselves some other way.
pub fn is_failure_response(response: &Value) -> bool {
    let Some(obj) = response.as_object() else {
        return false;
    };

    if obj.get("error").is_some_and(|e| !e.is_null()) {
        return true;
    }
    if obj.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        return true;
    }
    if obj.get("success").and_then(|v| v.as_bool()) == Some(false) {
        return true;
    }
    obj.get("message")
        .and_then(|m| m.as_str())
        .is_some_and(|m| m.to_lowercase().contains("error"))
}
