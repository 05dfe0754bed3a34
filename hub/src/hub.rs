//! The supervisor
//!
//! [`McpHub`] owns the configuration manager and the connection factory,
//! reconciles on every configuration change, exposes tool calls and
//! resource reads under the per-server timeout, and pushes the enriched
//! server list to observers.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{
    validate_server_config, ConfigChange, ConfigManager, ConfigSource, ListenerId, ServerConfig,
    DEFAULT_TIMEOUT_SECS,
};
use crate::connection::{Connection, ConnectionStatus, ServerSnapshot};
use crate::error::{FieldError, HubError, HubResult, MAX_TIMEOUT_SECS, MIN_TIMEOUT_SECS};
use crate::factory::ConnectionFactory;
use crate::reconcile::{ConnectionManager, ReconcileReport};
use crate::transport::{default_handlers, TransportHandler};

/// Construction options for [`McpHub`]
#[derive(Clone)]
pub struct HubOptions {
    pub global_config_dir: PathBuf,
    pub workspace_root: Option<PathBuf>,
    /// Watch the settings files and per-server paths
    pub watch_files: bool,
    /// Replaces the stdio, sse and streamable-http handlers when set
    pub handlers: Option<Vec<Arc<dyn TransportHandler>>>,
}

impl HubOptions {
    pub fn new(global_config_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_config_dir: global_config_dir.into(),
            workspace_root: None,
            watch_files: true,
            handlers: None,
        }
    }

    pub fn with_workspace(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn watch_files(mut self, watch: bool) -> Self {
        self.watch_files = watch;
        self
    }

    pub fn with_handlers(mut self, handlers: Vec<Arc<dyn TransportHandler>>) -> Self {
        self.handlers = Some(handlers);
        self
    }
}

/// Proof of registration returned by [`McpHub::register_client`]
#[derive(Debug)]
#[must_use = "pass the lease to unregister_client to release it"]
pub struct ClientLease {
    id: u64,
}

impl ClientLease {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
struct Leases {
    active: usize,
    next_id: u64,
}

pub struct McpHub {
    config: Arc<ConfigManager>,
    factory: Arc<ConnectionFactory>,
    manager: Arc<ConnectionManager>,
    servers_tx: watch::Sender<Vec<ServerSnapshot>>,
    listener_id: ListenerId,
    leases: Mutex<Leases>,
    disposed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl McpHub {
    /// Build the hub, connect every enabled server of both sources and,
    /// when requested, start watching the settings files.
    pub async fn new(options: HubOptions) -> HubResult<Arc<Self>> {
        let config = Arc::new(ConfigManager::new(
            options.global_config_dir,
            options.workspace_root,
        ));
        let global_path = config.config_path(ConfigSource::Global)?;
        debug!("Global MCP settings: {}", global_path.display());

        let handlers = match options.handlers {
            Some(handlers) => handlers,
            None => default_handlers(config.clone()),
        };

        let (publish_tx, publish_rx) = mpsc::unbounded_channel::<()>();
        let factory = ConnectionFactory::new(handlers, options.watch_files, Some(publish_tx));
        let manager = Arc::new(ConnectionManager::new(factory.clone(), config.clone()));

        let (change_tx, change_rx) = mpsc::unbounded_channel::<ConfigChange>();
        let listener_id = config.subscribe(Arc::new(move |change: &ConfigChange| {
            let _ = change_tx.send(change.clone());
        }));

        let (servers_tx, _) = watch::channel(Vec::new());
        let hub = Arc::new(Self {
            config,
            factory,
            manager,
            servers_tx,
            listener_id,
            leases: Mutex::new(Leases::default()),
            disposed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&hub);
        let tasks = vec![
            tokio::spawn(publish_loop(weak.clone(), publish_rx)),
            tokio::spawn(change_loop(weak, change_rx)),
        ];
        lock(&hub.tasks).extend(tasks);

        hub.manager.initialize_connections().await;
        if options.watch_files {
            let watched = hub.config.watch_config_files();
            debug!("Watching {} settings file(s)", watched);
        }
        hub.publish();

        info!("MCP hub started with {} connection(s)", hub.factory.connections().len());
        Ok(hub)
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Receiver of the enriched server list, updated after every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<ServerSnapshot>> {
        self.servers_tx.subscribe()
    }

    fn publish(&self) {
        if self.is_disposed() {
            return;
        }
        self.servers_tx.send_replace(self.get_all_servers());
    }

    /// Every configured server of both sources, global first, in file
    /// order. Servers without a live record (disabled or invalid ones) are
    /// synthesized from their configuration.
    pub fn get_all_servers(&self) -> Vec<ServerSnapshot> {
        let live = self.factory.connections();
        let mut servers = Vec::new();
        let mut seen = HashSet::new();

        for source in ConfigSource::ALL {
            let entries = match self.config.read_servers(source) {
                Ok(entries) => entries,
                Err(HubError::ConfigNotFound) => continue,
                Err(e) => {
                    debug!("Cannot read {} servers: {}", source, e);
                    continue;
                }
            };
            for (name, raw) in &entries {
                let parsed = validate_server_config(name, raw);
                let snapshot = match live.iter().find(|c| c.matches(name, source)) {
                    Some(connection) => enriched_snapshot(connection, parsed.ok()),
                    None => offline_snapshot(name, source, raw, parsed),
                };
                seen.insert((name.clone(), source));
                servers.push(snapshot);
            }
        }

        for connection in &live {
            if !seen.contains(&(connection.name().to_string(), connection.source())) {
                servers.push(connection.snapshot());
            }
        }
        servers
    }

    /// Enabled servers, one per name; a project server hides a global one
    /// of the same name.
    pub fn get_servers(&self) -> Vec<ServerSnapshot> {
        let mut servers: Vec<ServerSnapshot> = Vec::new();
        for snapshot in self.get_all_servers().into_iter().filter(|s| !s.disabled) {
            match servers.iter_mut().find(|s| s.name == snapshot.name) {
                Some(existing) if snapshot.source == ConfigSource::Project => *existing = snapshot,
                Some(_) => {}
                None => servers.push(snapshot),
            }
        }
        servers
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call a tool under the server's timeout.
    ///
    /// The call runs in its own task and is raced against the deadline; a
    /// timed-out call is not cancelled and may still complete remotely.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Map<String, Value>>,
        source: Option<ConfigSource>,
    ) -> HubResult<Value> {
        let connection = self.resolve_connection(server, source)?;
        let client = connected_client(&connection)?;
        let timeout = connection.config().timeout;
        debug!("Calling {}/{} (timeout {}s)", server, tool, timeout);

        let tool = tool.to_string();
        let call = tokio::spawn(async move { client.call_tool(&tool, arguments).await });
        with_deadline(server, timeout, call).await
    }

    pub async fn read_resource(&self, server: &str, uri: &str, source: Option<ConfigSource>) -> HubResult<Value> {
        let connection = self.resolve_connection(server, source)?;
        let client = connected_client(&connection)?;
        let timeout = connection.config().timeout;
        debug!("Reading {} from {} (timeout {}s)", uri, server, timeout);

        let uri = uri.to_string();
        let read = tokio::spawn(async move { client.read_resource(&uri).await });
        with_deadline(server, timeout, read).await
    }

    /// Live record for a call: the given source, else project then global.
    /// Never starts a connection.
    fn resolve_connection(&self, server: &str, source: Option<ConfigSource>) -> HubResult<Arc<Connection>> {
        let sources = candidate_sources(source);

        for source in &sources {
            if let Some(connection) = self.factory.find(server, *source) {
                if connection.config().disabled {
                    return Err(HubError::ServerDisabled(server.to_string()));
                }
                return Ok(connection);
            }
        }
        for source in sources {
            if let Ok(Some(config)) = self.config.server_config(source, server) {
                if config.disabled {
                    return Err(HubError::ServerDisabled(server.to_string()));
                }
            }
        }
        Err(HubError::ConnectionNotFound(server.to_string()))
    }

    /// Source holding `server`: the given one, else project then global
    fn resolve_source(&self, server: &str, source: Option<ConfigSource>) -> HubResult<ConfigSource> {
        if let Some(source) = source {
            return Ok(source);
        }
        for source in candidate_sources(None) {
            if let Ok(servers) = self.config.read_servers(source) {
                if servers.contains_key(server) {
                    return Ok(source);
                }
            }
        }
        Err(HubError::ConnectionNotFound(server.to_string()))
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn toggle_tool_always_allow(
        &self,
        server: &str,
        tool: &str,
        allow: bool,
        source: Option<ConfigSource>,
    ) -> HubResult<ReconcileReport> {
        let source = self.resolve_source(server, source)?;
        self.config.update_server_entry(source, server, |entry| {
            let mut tools: Vec<Value> = entry
                .get("alwaysAllow")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let present = tools.iter().any(|t| t.as_str() == Some(tool));
            if allow && !present {
                tools.push(Value::String(tool.to_string()));
            } else if !allow {
                tools.retain(|t| t.as_str() != Some(tool));
            }
            entry.insert("alwaysAllow".into(), Value::Array(tools));
            Ok(())
        })?;
        info!(
            "{} always-allow for {}/{}",
            if allow { "Granted" } else { "Revoked" },
            server,
            tool
        );
        self.resync(source).await
    }

    pub async fn toggle_server_disabled(
        &self,
        server: &str,
        disabled: bool,
        source: Option<ConfigSource>,
    ) -> HubResult<ReconcileReport> {
        let source = self.resolve_source(server, source)?;
        self.config.update_server_entry(source, server, |entry| {
            entry.insert("disabled".into(), Value::Bool(disabled));
            Ok(())
        })?;
        info!("{} MCP server '{}'", if disabled { "Disabled" } else { "Enabled" }, server);
        self.resync(source).await
    }

    /// Set the per-call timeout. Out-of-range values fail before anything
    /// is written.
    pub async fn update_server_timeout(
        &self,
        server: &str,
        secs: i64,
        source: Option<ConfigSource>,
    ) -> HubResult<ReconcileReport> {
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) {
            return Err(HubError::TimeoutRange(secs));
        }
        let source = self.resolve_source(server, source)?;
        self.config.update_server_entry(source, server, |entry| {
            entry.insert("timeout".into(), Value::from(secs));
            Ok(())
        })?;
        info!("Timeout of '{}' set to {}s", server, secs);
        self.resync(source).await
    }

    /// Insert or replace a server entry; new servers default to global
    pub async fn add_or_update_server(
        &self,
        server: &str,
        entry: Value,
        source: Option<ConfigSource>,
    ) -> HubResult<ServerConfig> {
        let source = source.unwrap_or_else(|| {
            self.resolve_source(server, None)
                .unwrap_or(ConfigSource::Global)
        });
        let config = self.config.add_or_update_server(source, server, entry)?;
        self.resync(source).await?;
        Ok(config)
    }

    pub async fn delete_server(&self, server: &str, source: Option<ConfigSource>) -> HubResult<ReconcileReport> {
        let source = self.resolve_source(server, source)?;
        self.config.delete_server_config(source, server)?;
        self.resync(source).await
    }

    pub async fn restart_connection(&self, server: &str, source: Option<ConfigSource>) -> HubResult<()> {
        let source = candidate_sources(source)
            .into_iter()
            .find(|s| self.factory.find(server, *s).is_some())
            .ok_or_else(|| HubError::ConnectionNotFound(server.to_string()))?;
        self.manager.restart_connection(server, source).await?;
        self.publish();
        Ok(())
    }

    /// Reconcile one source against its file and broadcast
    async fn resync(&self, source: ConfigSource) -> HubResult<ReconcileReport> {
        let servers = self.config.read_servers(source)?;
        let report = self.manager.update_server_connections(&servers, source).await;
        self.publish();
        Ok(report)
    }

    // ========================================================================
    // Ownership
    // ========================================================================

    /// Register an owner. The hub stays alive until every lease is returned.
    pub fn register_client(&self) -> ClientLease {
        let mut leases = lock(&self.leases);
        leases.active += 1;
        leases.next_id += 1;
        debug!("Registered hub client {} ({} active)", leases.next_id, leases.active);
        ClientLease { id: leases.next_id }
    }

    /// Return a lease; the last one disposes the hub
    pub async fn unregister_client(&self, lease: ClientLease) {
        let remaining = {
            let mut leases = lock(&self.leases);
            leases.active = leases.active.saturating_sub(1);
            leases.active
        };
        debug!("Unregistered hub client {} ({} remaining)", lease.id, remaining);
        if remaining == 0 {
            self.dispose().await;
        }
    }

    pub fn client_count(&self) -> usize {
        lock(&self.leases).active
    }

    /// Stop listening, then close every connection and watcher. Safe to call
    /// more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("MCP hub already disposed");
            return;
        }
        info!("Disposing MCP hub");

        self.config.unsubscribe(self.listener_id);
        self.config.dispose();
        self.factory.dispose().await;

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.servers_tx.send_replace(Vec::new());
    }
}

async fn publish_loop(hub: Weak<McpHub>, mut requests: mpsc::UnboundedReceiver<()>) {
    while requests.recv().await.is_some() {
        while requests.try_recv().is_ok() {}
        let Some(hub) = hub.upgrade() else {
            return;
        };
        hub.publish();
    }
}

/// Reconcile configuration changes in arrival order. Queued changes are
/// collapsed to the newest one per source so a stale snapshot is never
/// applied after a newer one.
async fn change_loop(hub: Weak<McpHub>, mut changes: mpsc::UnboundedReceiver<ConfigChange>) {
    while let Some(first) = changes.recv().await {
        let mut latest = vec![first];
        while let Ok(change) = changes.try_recv() {
            match latest.iter_mut().find(|c| c.source == change.source) {
                Some(slot) => *slot = change,
                None => latest.push(change),
            }
        }

        let Some(hub) = hub.upgrade() else {
            return;
        };
        for change in latest {
            if hub.is_disposed() {
                return;
            }
            hub.manager
                .update_server_connections(&change.servers, change.source)
                .await;
        }
        hub.publish();
    }
}

fn candidate_sources(source: Option<ConfigSource>) -> Vec<ConfigSource> {
    match source {
        Some(source) => vec![source],
        None => vec![ConfigSource::Project, ConfigSource::Global],
    }
}

fn connected_client(connection: &Connection) -> HubResult<Arc<dyn crate::transport::ClientSession>> {
    match connection.client() {
        Some(client) if connection.status() == ConnectionStatus::Connected => Ok(client),
        _ => Err(HubError::Transport(format!(
            "Server \"{}\" is not connected",
            connection.name()
        ))),
    }
}

async fn with_deadline(server: &str, secs: u64, call: JoinHandle<anyhow::Result<Value>>) -> HubResult<Value> {
    let joined = if secs == 0 {
        call.await
    } else {
        match tokio::time::timeout(Duration::from_secs(secs), call).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Request to '{}' timed out after {}s", server, secs);
                return Err(HubError::CallTimeout {
                    server: server.to_string(),
                    secs,
                });
            }
        }
    };
    match joined {
        Ok(result) => result.map_err(HubError::transport),
        Err(e) => Err(HubError::transport(e)),
    }
}

/// Live snapshot with tool permissions and settings taken from disk
fn enriched_snapshot(connection: &Connection, on_disk: Option<ServerConfig>) -> ServerSnapshot {
    let mut snapshot = connection.snapshot();
    if let Some(config) = on_disk {
        for tool in &mut snapshot.tools {
            tool.always_allow = config.is_tool_always_allowed(&tool.name);
        }
        snapshot.disabled = config.disabled;
        snapshot.timeout = config.timeout;
    }
    snapshot
}

fn offline_snapshot(
    name: &str,
    source: ConfigSource,
    raw: &Value,
    parsed: Result<ServerConfig, Vec<FieldError>>,
) -> ServerSnapshot {
    let (config, disabled, timeout, error) = match parsed {
        Ok(config) => (config.to_value(), config.disabled, config.timeout, None),
        Err(errors) => {
            let err = HubError::ConfigValidation {
                context: name.to_string(),
                errors,
            };
            let disabled = raw.get("disabled").and_then(Value::as_bool).unwrap_or(false);
            (raw.clone(), disabled, DEFAULT_TIMEOUT_SECS, Some(err.to_string()))
        }
    };
    ServerSnapshot {
        name: name.to_string(),
        source,
        status: ConnectionStatus::Disconnected,
        disabled,
        timeout,
        config,
        error,
        error_history: Vec::new(),
        tools: Vec::new(),
        resources: Vec::new(),
        resource_templates: Vec::new(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
