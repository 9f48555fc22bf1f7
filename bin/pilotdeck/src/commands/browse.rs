use serde_json::{json, Value};

use super::runtime::Runtime;
use crate::{BrowseCommands, Direction};

fn direction_name(d: Direction) -> &'static str {
    match d {
        Direction::Up => "up",
        Direction::Down => "down",
        Direction::Left => "left",
        Direction::Right => "right",
    }
}

/// Params for the `browser` tool, one per CLI action.
fn to_params(command: &BrowseCommands) -> Value {
    match command {
        BrowseCommands::Navigate { url } => json!({"action": "navigate", "url": url}),
        BrowseCommands::Click { x, y } => json!({"action": "click_at", "x": x, "y": y}),
        BrowseCommands::Type {
            x,
            y,
            text,
            enter,
            append,
        } => json!({
            "action": "type_text_at",
            "x": x,
            "y": y,
            "text": text,
            "press_enter": enter,
            "clear_before_typing": !append,
        }),
        BrowseCommands::Drag { x, y, to_x, to_y } => json!({
            "action": "drag_and_drop",
            "x": x,
            "y": y,
            "destination_x": to_x,
            "destination_y": to_y,
        }),
        BrowseCommands::Scroll {
            direction,
            amount,
            at,
        } => match at.as_deref() {
            Some([x, y]) => json!({
                "action": "scroll_at",
                "x": x,
                "y": y,
                "direction": direction_name(*direction),
                "magnitude": amount,
            }),
            _ => json!({
                "action": "scroll_document",
                "direction": direction_name(*direction),
                "amount": amount,
            }),
        },
        BrowseCommands::Eval { code } => json!({"action": "evaluate_script", "code": code}),
        BrowseCommands::Snapshot { .. } => json!({"action": "take_snapshot"}),
    }
}

pub async fn run(command: BrowseCommands) -> anyhow::Result<()> {
    let runtime = Runtime::load()?;
    let result = execute(&runtime, &command).await;
    runtime.shutdown().await;
    result
}

async fn execute(runtime: &Runtime, command: &BrowseCommands) -> anyhow::Result<()> {
    if let BrowseCommands::Snapshot { url: Some(url) } = command {
        runtime
            .run_tool("browser", json!({"action": "navigate", "url": url}))
            .await?;
    }

    let result = runtime.run_tool("browser", to_params(command)).await?;

    // Snapshots read better as the server's own text.
    if let Some(text) = result
        .get("snapshot")
        .and_then(|s| s.get("text"))
        .and_then(|t| t.as_str())
    {
        println!("{}", text);
    } else {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}
