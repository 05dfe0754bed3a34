use anyhow::Result;
use clap::Parser;

use mcp_hub::cli::Cli;
use mcp_hub::handlers::{run_command, CommandContext};
use mcp_hub::init::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("mcp_hub", cli.verbose)?;

    let ctx = CommandContext::from_cli(&cli);
    run_command(&ctx, cli.command).await
}
