//! Debounced filesystem watcher keyed by server
//!
//! Each key owns a set of watched paths. A change fires the key's callback
//! once the path has been quiet for the debounce window, so partial writes
//! are not observed. The watcher knows nothing about connections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Quiet period required before a change is reported
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Async callback fired with the changed path
pub type WatchCallback = Arc<dyn Fn(PathBuf) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One armed path: the OS watch plus its debounce task
struct PathWatch {
    path: PathBuf,
    /// Kept alive to maintain the OS watch
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for PathWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Filesystem watcher grouped by key
pub struct FileWatcher {
    watches: Mutex<HashMap<String, Vec<PathWatch>>>,
    debounce: Duration,
}

impl Default for FileWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FileWatcher {
    pub fn new() -> Self {
        Self::with_debounce(DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            watches: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    /// Replace the watchers for `key` with one watcher per path.
    ///
    /// Paths that cannot be watched are logged and skipped. Returns the
    /// number of paths armed. Must be called inside a tokio runtime.
    pub fn setup_watchers(&self, key: &str, paths: &[PathBuf], on_change: WatchCallback) -> usize {
        self.clear_watchers(Some(key));

        let mut armed = Vec::new();
        for path in paths {
            match self.arm(key, path, on_change.clone()) {
                Ok(watch) => armed.push(watch),
                Err(e) => warn!("Failed to watch {} for '{}': {}", path.display(), key, e),
            }
        }

        let count = armed.len();
        if count > 0 {
            debug!("Watching {} path(s) for '{}'", count, key);
            self.lock().insert(key.to_string(), armed);
        }
        count
    }

    /// Stop watching for one key, or for every key when `key` is None
    pub fn clear_watchers(&self, key: Option<&str>) {
        let removed: Vec<PathWatch> = {
            let mut watches = self.lock();
            match key {
                Some(key) => watches.remove(key).unwrap_or_default(),
                None => watches.drain().flat_map(|(_, w)| w).collect(),
            }
        };
        if !removed.is_empty() {
            debug!("Cleared {} watcher(s) for {}", removed.len(), key.unwrap_or("all keys"));
        }
    }

    /// Paths currently watched for `key`
    pub fn watched_paths(&self, key: &str) -> Vec<PathBuf> {
        self.lock()
            .get(key)
            .map(|w| w.iter().map(|p| p.path.clone()).collect())
            .unwrap_or_default()
    }

    pub fn dispose(&self) {
        self.clear_watchers(None);
        info!("File watcher disposed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<PathWatch>>> {
        self.watches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, key: &str, path: &Path, on_change: WatchCallback) -> notify::Result<PathWatch> {
        let (target, mode) = watch_target(path);
        let filter = path.to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    );
                    if relevant && event.paths.iter().any(|p| touches(&filter, p)) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            }
        })?;
        watcher.watch(&target, mode)?;

        let task = tokio::spawn(debounce_loop(
            key.to_string(),
            path.to_path_buf(),
            rx,
            self.debounce,
            on_change,
        ));

        Ok(PathWatch {
            path: path.to_path_buf(),
            _watcher: watcher,
            task,
        })
    }
}

/// Wait for an event, then for the path to go quiet, then fire the callback
async fn debounce_loop(
    key: String,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    on_change: WatchCallback,
) {
    while rx.recv().await.is_some() {
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        debug!("Change detected for '{}': {}", key, path.display());
        if let Err(e) = on_change(path.clone()).await {
            error!("Watch callback for '{}' failed: {:#}", key, e);
        }
    }
}

/// Directories are watched recursively. Files are watched through their
/// parent so that editors replacing the file do not drop the watch.
fn watch_target(path: &Path) -> (PathBuf, RecursiveMode) {
    if path.is_dir() {
        return (path.to_path_buf(), RecursiveMode::Recursive);
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            (parent.to_path_buf(), RecursiveMode::NonRecursive)
        }
        _ => (path.to_path_buf(), RecursiveMode::NonRecursive),
    }
}

/// Whether an event path concerns the watched path
fn touches(watched: &Path, event_path: &Path) -> bool {
    event_path == watched || event_path.starts_with(watched)
}
