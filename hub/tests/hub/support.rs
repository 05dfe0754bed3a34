//! Shared fixtures: a fake transport handler and a hub over temp dirs

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use mcp_hub::connection::{McpResource, McpResourceTemplate, McpTool};
use mcp_hub::transport::{ClientSession, StatusCallback, TransportHandler};
use mcp_hub::{
    ConfigSource, Connection, ConnectionStatus, HubOptions, HubResult, McpHub, ServerConfig,
    TransportKind,
};

/// Session that answers instantly, or after `delay` for tool calls
pub struct FakeClient {
    delay: Duration,
}

#[async_trait]
impl ClientSession for FakeClient {
    async fn list_tools(&self) -> anyhow::Result<Vec<McpTool>> {
        Ok(["echo", "write_file"]
            .iter()
            .map(|name| McpTool {
                name: name.to_string(),
                description: Some(format!("{} tool", name)),
                input_schema: Some(json!({ "type": "object" })),
                always_allow: false,
            })
            .collect())
    }

    async fn list_resources(&self) -> anyhow::Result<Vec<McpResource>> {
        Ok(vec![McpResource {
            uri: "memo://notes".into(),
            name: "notes".into(),
            description: None,
            mime_type: Some("text/plain".into()),
        }])
    }

    async fn list_resource_templates(&self) -> anyhow::Result<Vec<McpResourceTemplate>> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, tool: &str, arguments: Option<Map<String, Value>>) -> anyhow::Result<Value> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({
            "content": [{ "type": "text", "text": format!("{} ok", tool) }],
            "arguments": arguments,
        }))
    }

    async fn read_resource(&self, uri: &str) -> anyhow::Result<Value> {
        Ok(json!({ "contents": [{ "uri": uri, "text": "hello" }] }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handler for every built-in kind that counts creates and closes
#[derive(Default)]
pub struct FakeHandler {
    created: AtomicUsize,
    closed: AtomicUsize,
    call_delay: Mutex<Duration>,
}

impl FakeHandler {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl TransportHandler for FakeHandler {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn supports(&self, kind: &TransportKind) -> bool {
        !matches!(kind, TransportKind::Custom(_))
    }

    async fn create_connection(
        &self,
        name: &str,
        config: ServerConfig,
        source: ConfigSource,
        on_status_change: StatusCallback,
    ) -> HubResult<Arc<Connection>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(Connection::new(name, source, config));
        on_status_change(&connection);

        let client = Arc::new(FakeClient {
            delay: *self.call_delay.lock().unwrap(),
        });
        let tools = client.list_tools().await.unwrap_or_default();
        let resources = client.list_resources().await.unwrap_or_default();
        connection.attach_client(client);
        connection.set_capabilities(tools, resources, Vec::new());
        connection.set_status(ConnectionStatus::Connected);
        on_status_change(&connection);
        Ok(connection)
    }

    async fn close_connection(&self, _connection: &Connection) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A running hub over temporary settings
pub struct TestHub {
    pub hub: Arc<McpHub>,
    pub handler: Arc<FakeHandler>,
    pub global_dir: TempDir,
    pub workspace: TempDir,
}

impl TestHub {
    pub async fn start(global: Value, project: Option<Value>) -> Self {
        let global_dir = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        write_servers(&global_dir.path().join("mcp_settings.json"), global);
        if let Some(project) = project {
            write_servers(&workspace.path().join(".mcp.json"), project);
        }

        let handler = Arc::new(FakeHandler::default());
        let options = HubOptions::new(global_dir.path())
            .with_workspace(workspace.path())
            .watch_files(false)
            .with_handlers(vec![handler.clone()]);
        let hub = McpHub::new(options).await.unwrap();

        Self {
            hub,
            handler,
            global_dir,
            workspace,
        }
    }

    pub fn global_file(&self) -> std::path::PathBuf {
        self.global_dir.path().join("mcp_settings.json")
    }

    pub fn read_global(&self) -> Value {
        serde_json::from_str(&std::fs::read_to_string(self.global_file()).unwrap()).unwrap()
    }

    /// Let the background config pump drain
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn write_servers(path: &Path, servers: Value) {
    let doc = json!({ "mcpServers": servers });
    std::fs::write(path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
}
