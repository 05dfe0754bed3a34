//! Command handlers module
//!
//! One runner per CLI subcommand. [`CommandContext`] carries the resolved
//! global flags and starts the hub for each command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::cli::{Cli, Commands};
use crate::config::{default_config_dir, find_workspace_root};
use crate::hub::{ClientLease, HubOptions, McpHub};

pub mod calls;
pub mod manage;
pub mod servers;
pub mod watch;

pub use calls::{run_call, run_read};
pub use manage::{run_add, run_allow, run_delete, run_restart, run_set_disabled, run_timeout};
pub use servers::run_servers;
pub use watch::run_watch;

/// Shared context for command handlers
pub struct CommandContext {
    pub config_dir: PathBuf,
    pub workspace: Option<PathBuf>,
    pub verbose: u8,
}

impl CommandContext {
    /// Resolve with priority: CLI/env > discovery > defaults
    pub fn from_cli(cli: &Cli) -> Self {
        let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
        let workspace = cli.workspace.clone().or_else(|| {
            std::env::current_dir()
                .ok()
                .and_then(|cwd| find_workspace_root(&cwd))
        });
        Self {
            config_dir,
            workspace,
            verbose: cli.verbose,
        }
    }

    pub fn options(&self, watch_files: bool) -> HubOptions {
        let options = HubOptions::new(&self.config_dir).watch_files(watch_files);
        match &self.workspace {
            Some(root) => options.with_workspace(root),
            None => options,
        }
    }

    /// Start a hub and take a lease on it
    pub async fn open_hub(&self, watch_files: bool) -> Result<(Arc<McpHub>, ClientLease)> {
        let hub = McpHub::new(self.options(watch_files)).await?;
        let lease = hub.register_client();
        Ok((hub, lease))
    }
}

/// Dispatch a subcommand to its runner
pub async fn run_command(ctx: &CommandContext, command: Commands) -> Result<()> {
    match command {
        Commands::Servers { all, json } => run_servers(ctx, all, json).await,
        Commands::Call {
            server,
            tool,
            args,
            source,
        } => run_call(ctx, &server, &tool, args, source.source).await,
        Commands::Read { server, uri, source } => run_read(ctx, &server, &uri, source.source).await,
        Commands::Restart { server, source } => run_restart(ctx, &server, source.source).await,
        Commands::Enable { server, source } => run_set_disabled(ctx, &server, false, source.source).await,
        Commands::Disable { server, source } => run_set_disabled(ctx, &server, true, source.source).await,
        Commands::Timeout {
            server,
            seconds,
            source,
        } => run_timeout(ctx, &server, seconds, source.source).await,
        Commands::Allow {
            server,
            tool,
            revoke,
            source,
        } => run_allow(ctx, &server, &tool, !revoke, source.source).await,
        Commands::Add { server, json, source } => run_add(ctx, &server, &json, source.source).await,
        Commands::Delete { server, source } => run_delete(ctx, &server, source.source).await,
        Commands::Watch => run_watch(ctx).await,
    }
}
