//! CLI argument definitions

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ConfigSource;

#[derive(Parser)]
#[command(name = "mcp-hub")]
#[command(about = "Supervise MCP server connections from global and project settings")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace whose .mcp.json is the project source (default: nearest
    /// directory upward containing one)
    #[arg(long, global = true, env = "MCP_HUB_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Directory holding mcp_settings.json
    #[arg(long, global = true, env = "MCP_HUB_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Optional source scope shared by most commands
#[derive(Args, Clone, Copy, Debug, Default)]
pub struct SourceArg {
    /// Settings source: global or project (default: project first, then global)
    #[arg(long)]
    pub source: Option<ConfigSource>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List servers and their connection status
    Servers {
        /// Include disabled servers and shadowed duplicates
        #[arg(long, short)]
        all: bool,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Call a tool on a server
    Call {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, short)]
        args: Option<String>,
        #[command(flatten)]
        source: SourceArg,
    },
    /// Read a resource from a server
    Read {
        /// Server name
        server: String,
        /// Resource URI
        uri: String,
        #[command(flatten)]
        source: SourceArg,
    },
    /// Close and reconnect a server
    Restart {
        server: String,
        #[command(flatten)]
        source: SourceArg,
    },
    /// Enable a server
    Enable {
        server: String,
        #[command(flatten)]
        source: SourceArg,
    },
    /// Disable a server without removing its settings
    Disable {
        server: String,
        #[command(flatten)]
        source: SourceArg,
    },
    /// Set the per-call timeout of a server (0-3600 seconds)
    Timeout {
        server: String,
        #[arg(allow_negative_numbers = true)]
        seconds: i64,
        #[command(flatten)]
        source: SourceArg,
    },
    /// Allow a tool to run without confirmation
    Allow {
        server: String,
        tool: String,
        /// Remove the tool from the list instead
        #[arg(long)]
        revoke: bool,
        #[command(flatten)]
        source: SourceArg,
    },
    /// Add or replace a server entry
    Add {
        server: String,
        /// Entry as JSON, e.g. '{"command":"npx","args":["-y","pkg"]}'
        #[arg(long)]
        json: String,
        #[command(flatten)]
        source: SourceArg,
    },
    /// Remove a server entry
    Delete {
        server: String,
        #[command(flatten)]
        source: SourceArg,
    },
    /// Keep the hub running and print the server list on every change
    Watch,
}
