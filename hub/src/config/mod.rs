//! Configuration sources, schema and persistence
//!
//! Two independent sources feed the hub:
//! 1. Global settings at `<config dir>/mcp_settings.json`
//! 2. Project settings at `<workspace>/.mcp.json`

mod manager;
pub mod schema;

use std::path::{Path, PathBuf};

pub use manager::{ConfigChange, ConfigListener, ConfigManager, ListenerId};
pub use schema::{
    validate_all, validate_document_shape, validate_server_config, ConfigSource, HttpSettings,
    ServerConfig, StdioSettings, TransportConfig, TransportKind, DEFAULT_TIMEOUT_SECS, SERVERS_KEY,
};

/// File name of the global settings file inside the config dir
pub const GLOBAL_FILE_NAME: &str = "mcp_settings.json";

/// File name of the project settings file at the workspace root
pub const PROJECT_FILE_NAME: &str = ".mcp.json";

/// Default directory for global settings (`~/.config/mcp-hub` on Linux)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcp-hub")
}

/// Find the workspace root by walking up from `start` until a directory
/// containing `.mcp.json` is found.
///
/// Returns None when the filesystem root is reached without a match.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        if current.join(PROJECT_FILE_NAME).is_file() {
            return Some(current);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}
