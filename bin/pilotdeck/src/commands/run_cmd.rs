use serde_json::Value;

use super::runtime::Runtime;

/// Run a tool call through the registry, so hooks and correlation fire.
pub async fn tool(tool_name: &str, params_json: &str) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params_json)
        .map_err(|e| anyhow::anyhow!("Failed to parse JSON params: {}\nInput: {}", e, params_json))?;

    let runtime = Runtime::load()?;
    if runtime.registry().get(tool_name).is_none() {
        anyhow::bail!(
            "Tool '{}' not found. Available: {}",
            tool_name,
            runtime.registry().tool_names().join(", ")
        );
    }

    let result = runtime.run_tool(tool_name, params).await;
    runtime.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
