//! Tool call and resource read handlers

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use super::CommandContext;
use crate::config::ConfigSource;

/// Handle the `call` command - call a tool directly
pub async fn run_call(
    ctx: &CommandContext,
    server: &str,
    tool: &str,
    args: Option<String>,
    source: Option<ConfigSource>,
) -> Result<()> {
    let arguments = match args {
        Some(json) => Some(parse_arguments(&json)?),
        None => None,
    };

    let (hub, lease) = ctx.open_hub(false).await?;
    println!("Calling tool: {}/{}", server, tool);
    if let Some(ref a) = arguments {
        println!("Arguments: {}", serde_json::to_string_pretty(a)?);
    }
    println!();

    let result = hub.call_tool(server, tool, arguments, source).await;
    hub.unregister_client(lease).await;
    let result = result?;

    println!("Result:");
    print_content(&result)?;
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        anyhow::bail!("tool reported an error");
    }
    Ok(())
}

/// Handle the `read` command
pub async fn run_read(ctx: &CommandContext, server: &str, uri: &str, source: Option<ConfigSource>) -> Result<()> {
    let (hub, lease) = ctx.open_hub(false).await?;
    let result = hub.read_resource(server, uri, source).await;
    hub.unregister_client(lease).await;

    let contents = result?
        .get("contents")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for item in contents {
        match item.get("text").and_then(Value::as_str) {
            Some(text) => println!("{}", text),
            None => println!("{}", serde_json::to_string_pretty(&item)?),
        }
    }
    Ok(())
}

fn parse_arguments(json: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(json).context("--args is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--args must be a JSON object, got {}", other),
    }
}

/// Print text content as-is and anything else as JSON
fn print_content(result: &Value) -> Result<()> {
    let Some(content) = result.get("content").and_then(Value::as_array) else {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    };
    for item in content {
        match item.get("text").and_then(Value::as_str) {
            Some(text) => println!("{}", text),
            None => println!("{}", serde_json::to_string_pretty(item)?),
        }
    }
    Ok(())
}
