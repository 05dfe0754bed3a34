//! Server list command handler

use anyhow::Result;

use super::CommandContext;
use crate::connection::{ConnectionStatus, ServerSnapshot};

/// Handle the `servers` command
pub async fn run_servers(ctx: &CommandContext, all: bool, json: bool) -> Result<()> {
    let (hub, lease) = ctx.open_hub(false).await?;
    let servers = if all { hub.get_all_servers() } else { hub.get_servers() };
    hub.unregister_client(lease).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
        return Ok(());
    }

    if servers.is_empty() {
        println!("No MCP servers configured.");
        match &ctx.workspace {
            Some(root) => println!("Project settings: {}", root.join(".mcp.json").display()),
            None => println!("No workspace found; only global settings are used."),
        }
        return Ok(());
    }

    print_server_table(&servers, ctx.verbose >= 1);
    Ok(())
}

pub fn print_server_table(servers: &[ServerSnapshot], verbose: bool) {
    println!(
        "{:<24} {:<8} {:<13} {:>5} {:>8}  ERROR",
        "NAME", "SOURCE", "STATUS", "TOOLS", "TIMEOUT"
    );
    for server in servers {
        println!(
            "{:<24} {:<8} {:<13} {:>5} {:>7}s  {}",
            server.name,
            server.source,
            status_label(server),
            server.tools.len(),
            server.timeout,
            server.error.as_deref().map(first_line).unwrap_or("")
        );

        if verbose {
            for tool in &server.tools {
                let desc = tool
                    .description
                    .as_deref()
                    .map(first_line)
                    .unwrap_or("No description");
                let marker = if tool.always_allow { " (always allowed)" } else { "" };
                println!("    - {}{} : {}", tool.name, marker, desc);
            }
        }
    }
}

fn status_label(server: &ServerSnapshot) -> String {
    if server.disabled {
        return "disabled".to_string();
    }
    match server.status {
        ConnectionStatus::Connected => "connected".to_string(),
        ConnectionStatus::Connecting => "connecting".to_string(),
        ConnectionStatus::Disconnected => "disconnected".to_string(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
