//! Connection factory
//!
//! Owns the live connection list and the per-server file watchers, and
//! dispatches create and close to the first handler that supports a
//! server's transport kind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use futures::future::{join_all, BoxFuture};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigSource, ServerConfig, TransportConfig, TransportKind};
use crate::connection::{Connection, ConnectionStatus, ServerSnapshot};
use crate::error::{HubError, HubResult};
use crate::transport::{close_parts, StatusCallback, TransportHandler};
use crate::watcher::{FileWatcher, WatchCallback};

/// Argument fragments that mark a stdio server as a local build output
const BUILD_OUTPUT_MARKERS: &[&str] = &[
    "build/index.js",
    "dist/index.js",
    "target/debug/",
    "target/release/",
];

/// Watcher key of one (name, source) pair
pub fn watch_key(name: &str, source: ConfigSource) -> String {
    format!("{}@{}", name, source)
}

pub struct ConnectionFactory {
    handlers: Vec<Arc<dyn TransportHandler>>,
    connections: RwLock<Vec<Arc<Connection>>>,
    watcher: FileWatcher,
    watch_files: bool,
    /// Cleared on dispose; status callbacks and creates stop touching the list
    accepting: AtomicBool,
    /// Asks the owner to re-publish; a closed channel means the owner is gone
    publish: Option<UnboundedSender<()>>,
    this: Weak<ConnectionFactory>,
}

impl ConnectionFactory {
    pub fn new(
        handlers: Vec<Arc<dyn TransportHandler>>,
        watch_files: bool,
        publish: Option<UnboundedSender<()>>,
    ) -> Arc<Self> {
        Self::build(handlers, FileWatcher::new(), watch_files, publish)
    }

    /// Factory that arms per-server watchers on the given watcher
    pub fn with_watcher(
        handlers: Vec<Arc<dyn TransportHandler>>,
        watcher: FileWatcher,
        publish: Option<UnboundedSender<()>>,
    ) -> Arc<Self> {
        Self::build(handlers, watcher, true, publish)
    }

    fn build(
        handlers: Vec<Arc<dyn TransportHandler>>,
        watcher: FileWatcher,
        watch_files: bool,
        publish: Option<UnboundedSender<()>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            handlers,
            connections: RwLock::new(Vec::new()),
            watcher,
            watch_files,
            accepting: AtomicBool::new(true),
            publish,
            this: this.clone(),
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// First handler whose `supports` accepts `kind`
    pub fn handler_for(&self, kind: &TransportKind) -> HubResult<Arc<dyn TransportHandler>> {
        self.handlers
            .iter()
            .find(|h| h.supports(kind))
            .cloned()
            .ok_or_else(|| HubError::UnsupportedTransportType(kind.to_string()))
    }

    // ========================================================================
    // Live list
    // ========================================================================

    pub fn find(&self, name: &str, source: ConfigSource) -> Option<Arc<Connection>> {
        self.read().iter().find(|c| c.matches(name, source)).cloned()
    }

    /// Names of the live records of one source
    pub fn names_for(&self, source: ConfigSource) -> Vec<String> {
        self.read()
            .iter()
            .filter(|c| c.source() == source)
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.read().clone()
    }

    pub fn snapshots(&self) -> Vec<ServerSnapshot> {
        self.read().iter().map(|c| c.snapshot()).collect()
    }

    /// Insert or replace the record for its key. A different record that
    /// held the key is closed in the background.
    fn upsert(&self, connection: &Arc<Connection>) {
        let displaced = {
            let mut connections = self.write();
            match connections
                .iter()
                .position(|c| c.matches(connection.name(), connection.source()))
            {
                Some(i) if Arc::ptr_eq(&connections[i], connection) => None,
                Some(i) => Some(std::mem::replace(&mut connections[i], connection.clone())),
                None => {
                    connections.push(connection.clone());
                    None
                }
            }
        };
        if let Some(old) = displaced {
            self.retire(old);
        }
    }

    fn remove(&self, name: &str, source: ConfigSource) {
        self.write().retain(|c| !c.matches(name, source));
    }

    /// Drop this exact record; a newer record for the same key stays
    fn remove_record(&self, connection: &Arc<Connection>) {
        self.write().retain(|c| !Arc::ptr_eq(c, connection));
    }

    fn retire(&self, connection: Arc<Connection>) {
        if !connection.mark_closed() {
            return;
        }
        debug!("Closing displaced record for '{}' ({})", connection.name(), connection.source());
        let handler = self.handler_for(&connection.config().kind()).ok();
        tokio::spawn(async move {
            shutdown(handler, &connection).await;
        });
    }

    fn request_publish(&self) {
        if let Some(publish) = &self.publish {
            let _ = publish.send(());
        }
    }

    fn status_callback(&self) -> StatusCallback {
        let factory = self.this.clone();
        Arc::new(move |connection: &Arc<Connection>| {
            let Some(factory) = factory.upgrade() else {
                return;
            };
            if !factory.is_accepting() || connection.is_closed() {
                return;
            }
            factory.upsert(connection);
            factory.request_publish();
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create the connection for (name, source), replacing any live record.
    ///
    /// The previous record stays listed, in `connecting` state, until the new
    /// one takes its place. Only a missing handler or missing required
    /// fields fail; connect failures are recorded on the returned record.
    pub async fn create_connection(
        &self,
        name: &str,
        config: ServerConfig,
        source: ConfigSource,
    ) -> HubResult<Arc<Connection>> {
        if !self.is_accepting() {
            return Err(HubError::Transport("hub is shutting down".to_string()));
        }
        let handler = self.handler_for(&config.kind())?;

        if let Some(existing) = self.find(name, source) {
            existing.set_status(ConnectionStatus::Connecting);
            self.close_connection(name, Some(source), true).await;
        }

        debug!("Creating {} connection '{}' ({})", handler.name(), name, source);
        let connection = match handler
            .create_connection(name, config, source, self.status_callback())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.remove(name, source);
                self.request_publish();
                return Err(e);
            }
        };

        if !self.is_accepting() {
            connection.mark_closed();
            shutdown(Some(handler), &connection).await;
            self.remove(name, source);
            return Ok(connection);
        }

        if connection.is_closed() {
            debug!("'{}' ({}) was closed while connecting", name, source);
            self.remove_record(&connection);
            self.request_publish();
            return Ok(connection);
        }

        self.upsert(&connection);
        self.arm_watchers(&connection);
        self.request_publish();
        Ok(connection)
    }

    /// Close every record named `name`, optionally scoped to one source.
    ///
    /// Watchers are cleared first. With `keep` the closed records stay
    /// listed so observers see the gap of a restart. Returns how many
    /// records were closed.
    pub async fn close_connection(&self, name: &str, source: Option<ConfigSource>, keep: bool) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .read()
            .iter()
            .filter(|c| c.name() == name && source.map_or(true, |s| c.source() == s))
            .cloned()
            .collect();

        for connection in &targets {
            self.watcher
                .clear_watchers(Some(&watch_key(name, connection.source())));
            if connection.mark_closed() {
                let handler = self.handler_for(&connection.config().kind()).ok();
                shutdown(handler, connection).await;
            }
        }

        if !keep && !targets.is_empty() {
            self.write()
                .retain(|c| !targets.iter().any(|t| Arc::ptr_eq(t, c)));
            info!("Closed MCP server '{}'", name);
        }
        targets.len()
    }

    /// Close and recreate a live connection from its stored config
    pub async fn restart_connection(&self, name: &str, source: ConfigSource) -> HubResult<Arc<Connection>> {
        let connection = self
            .find(name, source)
            .ok_or_else(|| HubError::ConnectionNotFound(name.to_string()))?;
        let config = connection.config();

        info!("Restarting MCP server '{}' ({})", name, source);
        connection.set_status(ConnectionStatus::Connecting);
        self.request_publish();

        self.close_connection(name, Some(source), true).await;
        self.create_connection(name, config, source).await
    }

    /// Stop accepting work, clear watchers and close every connection.
    /// Individual close failures are logged and do not stop the teardown.
    pub async fn dispose(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.watcher.dispose();

        let connections: Vec<Arc<Connection>> = self.write().drain(..).collect();
        let count = connections.len();
        join_all(connections.iter().filter(|c| c.mark_closed()).map(|connection| {
            let handler = self.handler_for(&connection.config().kind()).ok();
            async move { shutdown(handler, connection).await }
        }))
        .await;
        info!("Connection factory disposed ({} connections closed)", count);
    }

    // ========================================================================
    // File watchers
    // ========================================================================

    pub fn watched_paths(&self, name: &str, source: ConfigSource) -> Vec<PathBuf> {
        self.watcher.watched_paths(&watch_key(name, source))
    }

    fn arm_watchers(&self, connection: &Connection) {
        if !self.watch_files {
            return;
        }
        let paths = watch_paths_for(&connection.config());
        if paths.is_empty() {
            return;
        }

        let name = connection.name().to_string();
        let source = connection.source();
        let factory = self.this.clone();
        let key = watch_key(&name, source);

        let callback: WatchCallback = Arc::new(move |path: PathBuf| -> BoxFuture<'static, anyhow::Result<()>> {
            let factory = factory.clone();
            let name = name.clone();
            Box::pin(async move {
                let Some(factory) = factory.upgrade() else {
                    return Ok(());
                };
                if !factory.is_accepting() {
                    return Ok(());
                }
                info!("{} changed, restarting MCP server '{}'", path.display(), name);
                // Restarting re-arms this key, which would abort the watch
                // task running this callback; run it detached.
                tokio::spawn(async move {
                    if let Err(e) = factory.restart_connection(&name, source).await {
                        error!("Restart of '{}' after file change failed: {}", name, e);
                    }
                });
                Ok(())
            })
        });

        self.watcher.setup_watchers(&key, &paths, callback);
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Connection>>> {
        self.connections.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Connection>>> {
        self.connections.write().unwrap_or_else(|e| e.into_inner())
    }
}

async fn shutdown(handler: Option<Arc<dyn TransportHandler>>, connection: &Connection) {
    match handler {
        Some(handler) => handler.close_connection(connection).await,
        None => {
            warn!("No handler for '{}', closing directly", connection.name());
            close_parts(connection).await;
        }
    }
}

/// Paths to watch for a server: its explicit `watchPaths`, plus the build
/// output a stdio server runs from.
pub fn watch_paths_for(config: &ServerConfig) -> Vec<PathBuf> {
    let base = match &config.transport {
        TransportConfig::Stdio(s) => s.cwd.as_deref().map(expand),
        _ => None,
    };
    let resolve = |raw: &str| {
        let path = expand(raw);
        match &base {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    };

    let mut paths: Vec<PathBuf> = config.watch_paths.iter().map(|p| resolve(p)).collect();
    if let TransportConfig::Stdio(settings) = &config.transport {
        for arg in &settings.args {
            let normalized = arg.replace('\\', "/");
            if BUILD_OUTPUT_MARKERS.iter().any(|m| normalized.contains(m)) {
                paths.push(resolve(arg));
            }
        }
    }

    let mut unique = Vec::with_capacity(paths.len());
    for path in paths {
        if !unique.contains(&path) {
            unique.push(path);
        }
    }
    unique
}

fn expand(raw: &str) -> PathBuf {
    let expanded = shellexpand::full(raw).unwrap_or_else(|_| raw.into());
    Path::new(expanded.as_ref()).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ErrorLevel;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Handler that connects after `delay` and counts calls
    #[derive(Default)]
    struct InstantHandler {
        created: AtomicUsize,
        closed: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl TransportHandler for InstantHandler {
        fn name(&self) -> &'static str {
            "instant"
        }

        fn supports(&self, kind: &TransportKind) -> bool {
            matches!(kind, TransportKind::Stdio)
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
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if !connection.is_closed() {
                connection.set_status(ConnectionStatus::Connected);
                on_status_change(&connection);
            }
            Ok(connection)
        }

        async fn close_connection(&self, connection: &Connection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            connection.record_error("closed", ErrorLevel::Info);
        }
    }

    fn factory() -> (Arc<ConnectionFactory>, Arc<InstantHandler>) {
        let handler = Arc::new(InstantHandler::default());
        (ConnectionFactory::new(vec![handler.clone()], false, None), handler)
    }

    #[tokio::test]
    async fn test_unsupported_kind() {
        let (factory, _) = factory();
        let config = ServerConfig::http(TransportKind::Sse, "http://localhost/sse");
        let err = factory
            .create_connection("remote", config, ConfigSource::Global)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnsupportedTransportType(k) if k == "sse"));
    }

    #[tokio::test]
    async fn test_one_record_per_key() {
        let (factory, handler) = factory();
        let config = ServerConfig::stdio("node", vec![]);
        factory
            .create_connection("srv", config.clone(), ConfigSource::Global)
            .await
            .unwrap();
        factory
            .create_connection("srv", config.clone(), ConfigSource::Global)
            .await
            .unwrap();
        factory
            .create_connection("srv", config, ConfigSource::Project)
            .await
            .unwrap();

        assert_eq!(factory.connections().len(), 2);
        assert_eq!(handler.created.load(Ordering::SeqCst), 3);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_scoped_to_source() {
        let (factory, _) = factory();
        let config = ServerConfig::stdio("node", vec![]);
        for source in ConfigSource::ALL {
            factory.create_connection("srv", config.clone(), source).await.unwrap();
        }

        assert_eq!(factory.close_connection("srv", Some(ConfigSource::Project), false).await, 1);
        assert!(factory.find("srv", ConfigSource::Global).is_some());
        assert!(factory.find("srv", ConfigSource::Project).is_none());

        assert_eq!(factory.close_connection("missing", None, false).await, 0);
    }

    #[tokio::test]
    async fn test_close_with_keep_leaves_record_listed() {
        let (factory, _) = factory();
        factory
            .create_connection("srv", ServerConfig::stdio("node", vec![]), ConfigSource::Global)
            .await
            .unwrap();
        factory.close_connection("srv", None, true).await;
        let kept = factory.find("srv", ConfigSource::Global).unwrap();
        assert!(kept.is_closed());
    }

    #[tokio::test]
    async fn test_restart_recreates_from_stored_config() {
        let (factory, handler) = factory();
        let mut config = ServerConfig::stdio("node", vec!["server.js".into()]);
        config.timeout = 15;
        let first = factory
            .create_connection("srv", config, ConfigSource::Global)
            .await
            .unwrap();

        let second = factory.restart_connection("srv", ConfigSource::Global).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert_eq!(second.config().timeout, 15);
        assert_eq!(handler.created.load(Ordering::SeqCst), 2);
        assert_eq!(factory.connections().len(), 1);

        let err = factory.restart_connection("nope", ConfigSource::Global).await.unwrap_err();
        assert_eq!(err.to_string(), "Server not found: nope");
    }

    #[tokio::test]
    async fn test_close_while_restarting_leaves_no_record() {
        let handler = Arc::new(InstantHandler {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let factory = ConnectionFactory::new(vec![handler.clone()], false, None);
        factory
            .create_connection("srv", ServerConfig::stdio("node", vec![]), ConfigSource::Global)
            .await
            .unwrap();

        let restarting = {
            let factory = factory.clone();
            tokio::spawn(async move { factory.restart_connection("srv", ConfigSource::Global).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(factory.close_connection("srv", Some(ConfigSource::Global), false).await, 1);

        let recreated = restarting.await.unwrap().unwrap();
        assert!(recreated.is_closed());
        assert!(factory.find("srv", ConfigSource::Global).is_none());
        assert!(factory.connections().is_empty());
    }

    #[tokio::test]
    async fn test_build_output_change_restarts_server() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let entry = root.join("build").join("index.js");
        std::fs::create_dir_all(entry.parent().unwrap()).unwrap();
        std::fs::write(&entry, "// v1").unwrap();

        let handler = Arc::new(InstantHandler::default());
        let factory = ConnectionFactory::with_watcher(
            vec![handler.clone()],
            FileWatcher::with_debounce(Duration::from_millis(50)),
            None,
        );
        let config = ServerConfig::stdio("node", vec![entry.to_string_lossy().into_owned()]);
        let first = factory
            .create_connection("srv", config, ConfigSource::Global)
            .await
            .unwrap();
        assert_eq!(factory.watched_paths("srv", ConfigSource::Global), vec![entry.clone()]);

        std::fs::write(&entry, "// v2").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.created.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(handler.created.load(Ordering::SeqCst), 2);
        assert!(first.is_closed());

        // The restarted record replaces the old one and re-arms the watch
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = factory.find("srv", ConfigSource::Global).unwrap();
        assert!(!Arc::ptr_eq(&first, &current));
        assert_eq!(factory.connections().len(), 1);
        assert_eq!(factory.watched_paths("srv", ConfigSource::Global), vec![entry]);
    }

    #[tokio::test]
    async fn test_dispose_closes_everything_and_rejects_creates() {
        let (factory, handler) = factory();
        for name in ["a", "b"] {
            factory
                .create_connection(name, ServerConfig::stdio("node", vec![]), ConfigSource::Global)
                .await
                .unwrap();
        }
        factory.dispose().await;
        assert!(factory.connections().is_empty());
        assert_eq!(handler.closed.load(Ordering::SeqCst), 2);
        assert!(factory
            .create_connection("c", ServerConfig::stdio("node", vec![]), ConfigSource::Global)
            .await
            .is_err());
    }

    #[test]
    fn test_watch_paths_include_build_outputs() {
        let mut config = ServerConfig::stdio("node", vec!["build/index.js".into(), "--verbose".into()]);
        if let TransportConfig::Stdio(s) = &mut config.transport {
            s.cwd = Some("/srv/tool".into());
        }
        config.watch_paths = vec!["/etc/tool.conf".into(), "/srv/tool/build/index.js".into()];

        let paths = watch_paths_for(&config);
        assert_eq!(
            paths,
            vec![PathBuf::from("/etc/tool.conf"), PathBuf::from("/srv/tool/build/index.js")]
        );
    }

    #[test]
    fn test_no_watch_paths_for_plain_servers() {
        let config = ServerConfig::stdio("npx", vec!["-y".into(), "some-server".into()]);
        assert!(watch_paths_for(&config).is_empty());
        let remote = ServerConfig::http(TransportKind::StreamableHttp, "https://example.com/mcp");
        assert!(watch_paths_for(&remote).is_empty());
    }
}
