//! Long-running watch command

use anyhow::Result;
use tracing::info;

use super::servers::print_server_table;
use super::CommandContext;

/// Handle the `watch` command
///
/// Runs the hub with file watching and prints the server list whenever it
/// changes, until Ctrl+C.
pub async fn run_watch(ctx: &CommandContext) -> Result<()> {
    let (hub, lease) = ctx.open_hub(true).await?;
    let mut updates = hub.subscribe();

    println!("Watching MCP servers (Ctrl+C to stop)\n");
    print_server_table(&updates.borrow_and_update().clone(), ctx.verbose >= 1);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let servers = updates.borrow_and_update().clone();
                println!();
                print_server_table(&servers, ctx.verbose >= 1);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    hub.unregister_client(lease).await;
    Ok(())
}
