//! Supervisor for MCP client connections
//!
//! Keeps one connection per configured server, driven by a global and a
//! project settings file, and reconciles the live set whenever either
//! changes.

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod handlers;
pub mod hub;
pub mod init;
pub mod reconcile;
pub mod transport;
pub mod watcher;

pub use config::{ConfigManager, ConfigSource, ServerConfig, TransportKind};
pub use connection::{Connection, ConnectionStatus, ServerSnapshot};
pub use error::{HubError, HubResult};
pub use hub::{ClientLease, HubOptions, McpHub};
pub use reconcile::ReconcileReport;
