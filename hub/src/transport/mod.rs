//! Transport handlers
//!
//! A [`TransportHandler`] opens and closes connections of one kind. The
//! factory picks the first handler whose `supports` accepts a server's
//! kind. Shared connect, fetch and close steps live here as free functions
//! so each handler only supplies its transport.

mod http;
mod session;
mod sse;
mod stdio;
mod streamable_http;
#[cfg(test)]
mod test_server;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{ConfigManager, ConfigSource, ServerConfig, TransportKind};
use crate::connection::{
    Connection, ConnectionStatus, ErrorLevel, McpResource, McpResourceTemplate, McpTool,
};
use crate::error::{HubError, HubResult};

pub use http::{SseDecoder, SseEvent};
pub use session::{HubClient, RmcpSession};
pub use sse::SseHandler;
pub use stdio::StdioHandler;
pub use streamable_http::StreamableHttpHandler;

// ============================================================================
// Capability interfaces
// ============================================================================

/// Protocol client for one connected server
#[async_trait]
pub trait ClientSession: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<McpTool>>;
    async fn list_resources(&self) -> anyhow::Result<Vec<McpResource>>;
    async fn list_resource_templates(&self) -> anyhow::Result<Vec<McpResourceTemplate>>;
    async fn call_tool(&self, tool: &str, arguments: Option<Map<String, Value>>) -> anyhow::Result<Value>;
    async fn read_resource(&self, uri: &str) -> anyhow::Result<Value>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// The resource underneath a session (child process, HTTP tasks)
#[async_trait]
pub trait TransportGuard: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

/// Invoked whenever a connection's observable state changes
pub type StatusCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Opens and closes connections of one transport kind
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn supports(&self, kind: &TransportKind) -> bool;

    /// Create a connection. Fails only when required fields are missing;
    /// connection failures are reported through the returned record's
    /// status and error history.
    async fn create_connection(
        &self,
        name: &str,
        config: ServerConfig,
        source: ConfigSource,
        on_status_change: StatusCallback,
    ) -> HubResult<Arc<Connection>>;

    /// Best-effort close of the session and the transport
    async fn close_connection(&self, connection: &Connection) {
        close_parts(connection).await;
    }
}

/// Stores session ids issued by streamable-http servers
pub trait SessionStore: Send + Sync {
    fn persist_session_id(&self, source: ConfigSource, name: &str, session_id: &str) -> HubResult<()>;
}

impl SessionStore for ConfigManager {
    fn persist_session_id(&self, source: ConfigSource, name: &str, session_id: &str) -> HubResult<()> {
        ConfigManager::persist_session_id(self, source, name, session_id)
    }
}

/// The stdio, sse and streamable-http handlers, in that order
pub fn default_handlers(sessions: Arc<dyn SessionStore>) -> Vec<Arc<dyn TransportHandler>> {
    vec![
        Arc::new(StdioHandler::new()),
        Arc::new(SseHandler::new()),
        Arc::new(StreamableHttpHandler::new(sessions)),
    ]
}

// ============================================================================
// Shared connection steps
// ============================================================================

/// Handshake deadline; a timeout of 0 means no deadline
pub fn connect_deadline(config: &ServerConfig) -> Option<Duration> {
    (config.timeout > 0).then(|| Duration::from_secs(config.timeout))
}

/// Record a failure and mark the connection disconnected
pub fn fail_connection(connection: &Connection, message: &str) {
    connection.set_status(ConnectionStatus::Disconnected);
    connection.record_error(message, ErrorLevel::Error);
}

/// Fetch tools, resources and templates. Each list is best-effort: a
/// failure leaves that list empty.
pub async fn fetch_capabilities(connection: &Connection, client: &dyn ClientSession) {
    let config = connection.config();
    let (tools, resources, templates) = tokio::join!(
        client.list_tools(),
        client.list_resources(),
        client.list_resource_templates()
    );

    let tools = tools
        .map(|tools| {
            tools
                .into_iter()
                .map(|mut tool| {
                    tool.always_allow = config.is_tool_always_allowed(&tool.name);
                    tool
                })
                .collect()
        })
        .unwrap_or_else(|e| {
            debug!("Failed to list tools from '{}': {:#}", connection.name(), e);
            Vec::new()
        });
    let resources = resources.unwrap_or_else(|e| {
        debug!("Failed to list resources from '{}': {:#}", connection.name(), e);
        Vec::new()
    });
    let templates = templates.unwrap_or_else(|e| {
        debug!("Failed to list resource templates from '{}': {:#}", connection.name(), e);
        Vec::new()
    });

    connection.set_capabilities(tools, resources, templates);
}

/// Re-fetch only the resource list and report the change
pub async fn refresh_resources(connection: &Arc<Connection>, on_status_change: &StatusCallback) {
    let Some(client) = connection.client() else {
        return;
    };
    match client.list_resources().await {
        Ok(resources) => {
            debug!("Resources of '{}' changed: {} now", connection.name(), resources.len());
            connection.set_resources(resources);
            on_status_change(connection);
        }
        Err(e) => warn!("Failed to refresh resources of '{}': {:#}", connection.name(), e),
    }
}

/// Run a handler's connect step under the handshake deadline and settle the
/// record: connected with capabilities, or disconnected with the error.
pub async fn finish_connect<F>(connection: &Arc<Connection>, on_status_change: &StatusCallback, connect: F)
where
    F: Future<Output = anyhow::Result<Arc<dyn ClientSession>>>,
{
    let config = connection.config();
    let result = match connect_deadline(&config) {
        Some(deadline) => match tokio::time::timeout(deadline, connect).await {
            Ok(result) => result.map_err(HubError::transport),
            Err(_) => Err(HubError::ConnectTimeout {
                server: connection.name().to_string(),
                secs: config.timeout,
            }),
        },
        None => connect.await.map_err(HubError::transport),
    };

    match result {
        Ok(client) => {
            connection.attach_client(client.clone());
            if connection.is_closed() {
                debug!("'{}' was closed while connecting", connection.name());
                close_parts(connection).await;
                return;
            }
            connection.clear_error();
            connection.set_status(ConnectionStatus::Connected);
            fetch_capabilities(connection, client.as_ref()).await;
            info!(
                "Connected to MCP server '{}' ({}, {} tools)",
                connection.name(),
                connection.source(),
                connection.tools().len()
            );
        }
        Err(e) => {
            warn!("Failed to connect to MCP server '{}': {}", connection.name(), e);
            fail_connection(connection, &e.to_string());
            close_parts(connection).await;
        }
    }

    on_status_change(connection);
}

/// Close the session and then the transport; failures are logged and
/// neither step prevents the other.
pub async fn close_parts(connection: &Connection) {
    if let Some(client) = connection.take_client() {
        if let Err(e) = client.close().await {
            warn!("Error closing client for '{}': {:#}", connection.name(), e);
        }
    }
    if let Some(transport) = connection.take_transport() {
        if let Err(e) = transport.close().await {
            warn!("Error closing transport for '{}': {:#}", connection.name(), e);
        }
    }
}

/// Record that is returned already failed, used when setup fails before any
/// transport exists
pub fn failed_connection(
    name: &str,
    config: ServerConfig,
    source: ConfigSource,
    error: &anyhow::Error,
    on_status_change: &StatusCallback,
) -> Arc<Connection> {
    let connection = Arc::new(Connection::new(name, source, config));
    on_status_change(&connection);
    fail_connection(&connection, &format!("{:#}", error));
    on_status_change(&connection);
    connection
}
