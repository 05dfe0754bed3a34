//! Protocol session backed by rmcp

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, ReadResourceRequestParam};
use rmcp::service::{NotificationContext, Peer, RunningService};
use rmcp::{ClientHandler, RoleClient};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use super::{refresh_resources, ClientSession, StatusCallback};
use crate::connection::{Connection, McpResource, McpResourceTemplate, McpTool};

/// Client side of one connection: answers server notifications.
///
/// The record owns the session, so the handler only holds it weakly.
#[derive(Clone)]
pub struct HubClient {
    connection: Weak<Connection>,
    on_status_change: StatusCallback,
}

impl HubClient {
    pub fn new(connection: &Arc<Connection>, on_status_change: StatusCallback) -> Self {
        Self {
            connection: Arc::downgrade(connection),
            on_status_change,
        }
    }
}

impl ClientHandler for HubClient {
    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        if connection.is_closed() {
            return;
        }
        refresh_resources(&connection, &self.on_status_change).await;
    }
}

/// A running rmcp client service
pub struct RmcpSession {
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, HubClient>>>,
}

impl RmcpSession {
    pub fn new(service: RunningService<RoleClient, HubClient>) -> Self {
        Self {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }
    }
}

#[async_trait]
impl ClientSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let tools = self.peer.list_all_tools().await.context("Failed to list tools")?;
        Ok(tools
            .into_iter()
            .map(|t| McpTool {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: Some(Value::Object(t.input_schema.as_ref().clone())),
                always_allow: false,
            })
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>> {
        let resources = self
            .peer
            .list_all_resources()
            .await
            .context("Failed to list resources")?;
        Ok(resources
            .into_iter()
            .map(|r| McpResource {
                uri: r.raw.uri.to_string(),
                name: r.raw.name.to_string(),
                description: r.raw.description.as_ref().map(|d| d.to_string()),
                mime_type: r.raw.mime_type.as_ref().map(|m| m.to_string()),
            })
            .collect())
    }

    async fn list_resource_templates(&self) -> Result<Vec<McpResourceTemplate>> {
        let templates = self
            .peer
            .list_all_resource_templates()
            .await
            .context("Failed to list resource templates")?;
        Ok(templates
            .into_iter()
            .map(|t| McpResourceTemplate {
                uri_template: t.raw.uri_template.to_string(),
                name: t.raw.name.to_string(),
                description: t.raw.description.as_ref().map(|d| d.to_string()),
                mime_type: t.raw.mime_type.as_ref().map(|m| m.to_string()),
            })
            .collect())
    }

    async fn call_tool(&self, tool: &str, arguments: Option<Map<String, Value>>) -> Result<Value> {
        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments,
                task: None,
            })
            .await
            .context("Failed to call tool")?;
        Ok(serde_json::to_value(result)?)
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        let params: ReadResourceRequestParam = serde_json::from_value(json!({ "uri": uri }))?;
        let result = self
            .peer
            .read_resource(params)
            .await
            .context("Failed to read resource")?;
        Ok(serde_json::to_value(result)?)
    }

    async fn close(&self) -> Result<()> {
        if let Some(service) = self.service.lock().await.take() {
            service.cancel().await.context("Failed to cancel MCP service")?;
        }
        Ok(())
    }
}
