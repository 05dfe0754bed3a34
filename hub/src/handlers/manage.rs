//! Configuration mutation handlers
//!
//! Each command edits the settings file through the hub, which reconciles
//! the affected source before returning.

use anyhow::{Context, Result};
use serde_json::Value;

use super::CommandContext;
use crate::config::ConfigSource;
use crate::hub::McpHub;
use crate::reconcile::ReconcileReport;

fn print_report(report: &ReconcileReport) {
    if report.is_noop() {
        println!("No connection changes.");
        return;
    }
    for name in &report.created {
        println!("  + connected {}", name);
    }
    for name in &report.recreated {
        println!("  ~ reconnected {}", name);
    }
    for name in &report.closed {
        println!("  - closed {}", name);
    }
    for name in &report.patched {
        println!("  * updated {}", name);
    }
    for (name, reason) in &report.failed {
        println!("  ! {}: {}", name, reason);
    }
}

fn print_status(hub: &McpHub, server: &str) {
    if let Some(snapshot) = hub.get_all_servers().into_iter().find(|s| s.name == server) {
        match &snapshot.error {
            Some(error) => println!("{} ({}): {} - {}", server, snapshot.source, snapshot.status, error),
            None => println!("{} ({}): {}", server, snapshot.source, snapshot.status),
        }
    }
}

/// Handle the `restart` command
pub async fn run_restart(ctx: &CommandContext, server: &str, source: Option<ConfigSource>) -> Result<()> {
    let (hub, lease) = ctx.open_hub(false).await?;
    let result = hub.restart_connection(server, source).await;
    if result.is_ok() {
        print_status(&hub, server);
    }
    hub.unregister_client(lease).await;
    Ok(result?)
}

/// Handle the `enable` and `disable` commands
pub async fn run_set_disabled(
    ctx: &CommandContext,
    server: &str,
    disabled: bool,
    source: Option<ConfigSource>,
) -> Result<()> {
    let (hub, lease) = ctx.open_hub(false).await?;
    let result = hub.toggle_server_disabled(server, disabled, source).await;
    hub.unregister_client(lease).await;

    let report = result?;
    println!("{} {}", if disabled { "Disabled" } else { "Enabled" }, server);
    print_report(&report);
    Ok(())
}

/// Handle the `timeout` command
pub async fn run_timeout(ctx: &CommandContext, server: &str, seconds: i64, source: Option<ConfigSource>) -> Result<()> {
    let (hub, lease) = ctx.open_hub(false).await?;
    let result = hub.update_server_timeout(server, seconds, source).await;
    hub.unregister_client(lease).await;

    result?;
    println!("Timeout of {} set to {}s", server, seconds);
    Ok(())
}

/// Handle the `allow` command
pub async fn run_allow(
    ctx: &CommandContext,
    server: &str,
    tool: &str,
    allow: bool,
    source: Option<ConfigSource>,
) -> Result<()> {
    let (hub, lease) = ctx.open_hub(false).await?;
    let result = hub.toggle_tool_always_allow(server, tool, allow, source).await;
    hub.unregister_client(lease).await;

    result?;
    if allow {
        println!("{}/{} will run without confirmation", server, tool);
    } else {
        println!("{}/{} requires confirmation again", server, tool);
    }
    Ok(())
}

/// Handle the `add` command
pub async fn run_add(ctx: &CommandContext, server: &str, json: &str, source: Option<ConfigSource>) -> Result<()> {
    let entry: Value = serde_json::from_str(json).context("--json is not valid JSON")?;

    let (hub, lease) = ctx.open_hub(false).await?;
    let result = hub.add_or_update_server(server, entry, source).await;
    if result.is_ok() {
        print_status(&hub, server);
    }
    hub.unregister_client(lease).await;

    let config = result?;
    println!("Saved {} ({})", server, config.kind());
    Ok(())
}

/// Handle the `delete` command
pub async fn run_delete(ctx: &CommandContext, server: &str, source: Option<ConfigSource>) -> Result<()> {
    let (hub, lease) = ctx.open_hub(false).await?;
    let result = hub.delete_server(server, source).await;
    hub.unregister_client(lease).await;

    let report = result?;
    println!("Deleted {}", server);
    print_report(&report);
    Ok(())
}
