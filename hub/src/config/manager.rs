//! Configuration manager
//!
//! Resolves the global and project settings files, performs validated
//! read-modify-write updates, watches both files, and notifies listeners
//! with the full server map of the source that changed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::schema::{
    validate_all, validate_document_shape, validate_server_config, ConfigSource, ServerConfig,
    SERVERS_KEY,
};
use super::{GLOBAL_FILE_NAME, PROJECT_FILE_NAME};
use crate::error::{HubError, HubResult};
use crate::watcher::{FileWatcher, WatchCallback};

/// Full server map of one source after a change
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub source: ConfigSource,
    pub servers: Map<String, Value>,
}

/// Listener invoked synchronously on every change
pub type ConfigListener = Arc<dyn Fn(&ConfigChange) + Send + Sync>;

/// Handle returned by [`ConfigManager::subscribe`]
pub type ListenerId = u64;

pub struct ConfigManager {
    global_dir: PathBuf,
    workspace_root: Option<PathBuf>,
    /// Resolved file paths, filled on first access
    paths: Mutex<HashMap<ConfigSource, PathBuf>>,
    listeners: Mutex<Vec<(ListenerId, ConfigListener)>>,
    next_listener_id: AtomicU64,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
    watcher: FileWatcher,
}

impl ConfigManager {
    pub fn new(global_dir: impl Into<PathBuf>, workspace_root: Option<PathBuf>) -> Self {
        Self {
            global_dir: global_dir.into(),
            workspace_root,
            paths: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            write_lock: Mutex::new(()),
            watcher: FileWatcher::new(),
        }
    }

    // ========================================================================
    // Path resolution
    // ========================================================================

    /// Resolve the settings file of a source.
    ///
    /// The global file is created with an empty server map when missing.
    /// The project source fails with [`HubError::ConfigNotFound`] when no
    /// workspace is open.
    pub fn config_path(&self, source: ConfigSource) -> HubResult<PathBuf> {
        if let Some(path) = lock(&self.paths).get(&source) {
            return Ok(path.clone());
        }

        let path = match source {
            ConfigSource::Global => {
                let path = self.global_dir.join(GLOBAL_FILE_NAME);
                if !path.exists() {
                    std::fs::create_dir_all(&self.global_dir)?;
                    write_document(&path, &empty_document())?;
                    info!("Created global MCP settings at {}", path.display());
                }
                path
            }
            ConfigSource::Project => self
                .workspace_root
                .as_ref()
                .map(|root| root.join(PROJECT_FILE_NAME))
                .ok_or(HubError::ConfigNotFound)?,
        };

        lock(&self.paths).insert(source, path.clone());
        Ok(path)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Parse a settings file into its server map.
    ///
    /// A missing or blank file reads as an empty map. Returns a syntax or
    /// validation error rather than partially parsed data.
    pub fn read_config(&self, path: &Path) -> HubResult<Map<String, Value>> {
        let doc = load_document(path)?;
        Ok(servers_of(&doc).cloned().unwrap_or_default())
    }

    /// Server map of a source
    pub fn read_servers(&self, source: ConfigSource) -> HubResult<Map<String, Value>> {
        let path = self.config_path(source)?;
        self.read_config(&path)
    }

    /// Validated entry for one server, None when absent
    pub fn server_config(&self, source: ConfigSource, name: &str) -> HubResult<Option<ServerConfig>> {
        let servers = self.read_servers(source)?;
        match servers.get(name) {
            Some(raw) => validate_server_config(name, raw)
                .map(Some)
                .map_err(|errors| HubError::ConfigValidation {
                    context: name.to_string(),
                    errors,
                }),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Apply `mutate` to an existing entry, validate the result, persist it
    /// and notify listeners.
    pub fn update_server_entry<F>(&self, source: ConfigSource, name: &str, mutate: F) -> HubResult<ServerConfig>
    where
        F: FnOnce(&mut Map<String, Value>) -> HubResult<()>,
    {
        let (config, servers) = self.modify(source, |servers| {
            let entry = servers
                .get_mut(name)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| HubError::ConnectionNotFound(name.to_string()))?;
            mutate(entry)?;
            let raw = Value::Object(entry.clone());
            validated(name, &raw).map(Some)
        })?;
        self.notify(&ConfigChange { source, servers });
        config.ok_or_else(|| HubError::ConnectionNotFound(name.to_string()))
    }

    /// Insert or replace a whole entry
    pub fn add_or_update_server(&self, source: ConfigSource, name: &str, entry: Value) -> HubResult<ServerConfig> {
        let config = validated(name, &entry)?;
        let (_, servers) = self.modify(source, |servers| {
            servers.insert(name.to_string(), entry);
            Ok(None)
        })?;
        info!("Saved MCP server '{}' to {} settings", name, source);
        self.notify(&ConfigChange { source, servers });
        Ok(config)
    }

    /// Remove an entry
    pub fn delete_server_config(&self, source: ConfigSource, name: &str) -> HubResult<()> {
        let (_, servers) = self.modify(source, |servers| {
            servers
                .shift_remove(name)
                .map(|_| None)
                .ok_or_else(|| HubError::ConnectionNotFound(name.to_string()))
        })?;
        info!("Deleted MCP server '{}' from {} settings", name, source);
        self.notify(&ConfigChange { source, servers });
        Ok(())
    }

    /// Store a session id issued by a streamable-http server
    pub fn persist_session_id(&self, source: ConfigSource, name: &str, session_id: &str) -> HubResult<()> {
        let id = session_id.to_string();
        self.update_server_entry(source, name, move |entry| {
            entry.insert("sessionId".into(), Value::String(id));
            Ok(())
        })?;
        debug!("Persisted session id for '{}' ({})", name, source);
        Ok(())
    }

    /// Read-modify-write of one source's server map under the write lock
    fn modify<F>(&self, source: ConfigSource, f: F) -> HubResult<(Option<ServerConfig>, Map<String, Value>)>
    where
        F: FnOnce(&mut Map<String, Value>) -> HubResult<Option<ServerConfig>>,
    {
        let path = self.config_path(source)?;
        let _guard = lock(&self.write_lock);

        let mut doc = load_document(&path)?;
        let root = doc.as_object_mut().ok_or_else(|| {
            HubError::invalid_field(path.display().to_string(), "$", "must be a JSON object")
        })?;
        let servers = root
            .entry(SERVERS_KEY)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| {
                HubError::invalid_field(path.display().to_string(), SERVERS_KEY, "must be an object")
            })?;

        let config = f(servers)?;
        let snapshot = servers.clone();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_document(&path, &doc)?;
        Ok((config, snapshot))
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn subscribe(&self, listener: ConfigListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        lock(&self.listeners).retain(|(lid, _)| *lid != id);
    }

    fn notify(&self, change: &ConfigChange) {
        let listeners: Vec<ConfigListener> =
            lock(&self.listeners).iter().map(|(_, l)| l.clone()).collect();
        debug!(
            "Config change in {} settings ({} servers, {} listeners)",
            change.source,
            change.servers.len(),
            listeners.len()
        );
        for listener in listeners {
            listener(change);
        }
    }

    // ========================================================================
    // File watching
    // ========================================================================

    /// Watch both settings files. A change is propagated only when every
    /// entry in the file validates. Returns the number of files watched.
    pub fn watch_config_files(self: &Arc<Self>) -> usize {
        let mut watched = 0;
        for source in ConfigSource::ALL {
            let path = match self.config_path(source) {
                Ok(path) => path,
                Err(HubError::ConfigNotFound) => continue,
                Err(e) => {
                    warn!("Cannot watch {} settings: {}", source, e);
                    continue;
                }
            };
            let weak = Arc::downgrade(self);
            watched += self
                .watcher
                .setup_watchers(source.as_str(), &[path], config_file_callback(weak, source));
        }
        watched
    }

    /// Stop watching and drop all listeners
    pub fn dispose(&self) {
        self.watcher.dispose();
        lock(&self.listeners).clear();
    }

    /// Re-read a changed file and notify only when it is entirely valid
    fn on_file_changed(&self, source: ConfigSource, path: &Path) {
        let servers = match self.read_config(path) {
            Ok(servers) => servers,
            Err(e) => {
                warn!("Ignoring change to {}: {}", path.display(), e);
                return;
            }
        };
        if let Err(errors) = validate_all(&servers) {
            let err = HubError::ConfigValidation {
                context: path.display().to_string(),
                errors,
            };
            warn!("Ignoring change to {}: {}", path.display(), err);
            return;
        }
        info!("{} settings changed on disk", source);
        self.notify(&ConfigChange { source, servers });
    }
}

fn config_file_callback(manager: Weak<ConfigManager>, source: ConfigSource) -> WatchCallback {
    Arc::new(move |path: PathBuf| -> BoxFuture<'static, anyhow::Result<()>> {
        let manager = manager.clone();
        Box::pin(async move {
            if let Some(manager) = manager.upgrade() {
                manager.on_file_changed(source, &path);
            }
            Ok(())
        })
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn empty_document() -> Value {
    json!({ "mcpServers": {} })
}

fn servers_of(doc: &Value) -> Option<&Map<String, Value>> {
    doc.get(SERVERS_KEY).and_then(Value::as_object)
}

fn validated(name: &str, raw: &Value) -> HubResult<ServerConfig> {
    validate_server_config(name, raw).map_err(|errors| HubError::ConfigValidation {
        context: name.to_string(),
        errors,
    })
}

fn load_document(path: &Path) -> HubResult<Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(empty_document()),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(empty_document());
    }

    let doc: Value = serde_json::from_str(&content).map_err(|e| HubError::ConfigSyntax {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_document_shape(&doc).map_err(|errors| HubError::ConfigValidation {
        context: path.display().to_string(),
        errors,
    })?;
    Ok(doc)
}

fn write_document(path: &Path, doc: &Value) -> HubResult<()> {
    let mut content = serde_json::to_string_pretty(doc)?;
    content.push('\n');
    std::fs::write(path, content)?;
    Ok(())
}
