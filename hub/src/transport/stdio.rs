//! Stdio transport: the server runs as a child process
//!
//! stderr is drained from the moment the process starts, before the
//! handshake, so early diagnostics land in the error history. A monitor
//! task reports unexpected exits.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::ServiceExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    fail_connection, failed_connection, finish_connect, ClientSession, HubClient, RmcpSession,
    StatusCallback, TransportGuard, TransportHandler,
};
use crate::config::{ConfigSource, ServerConfig, StdioSettings, TransportConfig, TransportKind};
use crate::connection::{Connection, ConnectionStatus, ErrorLevel};
use crate::error::{HubError, HubResult};

/// How long close waits for the child to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct StdioHandler;

impl StdioHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdioHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportHandler for StdioHandler {
    fn name(&self) -> &'static str {
        "stdio"
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
        let settings = match &config.transport {
            TransportConfig::Stdio(settings) if !settings.command.trim().is_empty() => settings.clone(),
            TransportConfig::Stdio(_) => {
                return Err(HubError::invalid_field(name, "command", "is required for stdio servers"))
            }
            _ => return Err(HubError::UnsupportedTransportType(config.kind().to_string())),
        };

        let mut child = match spawn_server(name, &settings) {
            Ok(child) => child,
            Err(e) => return Ok(failed_connection(name, config, source, &e, &on_status_change)),
        };

        let connection = Arc::new(Connection::new(name, source, config));
        on_status_change(&connection);

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, connection.clone(), on_status_change.clone()));
        }
        let stdout = child.stdout.take();
        let stdin = child.stdin.take();

        let guard = ChildGuard::watch(child, connection.clone(), on_status_change.clone());
        connection.attach_transport(guard);

        let client = HubClient::new(&connection, on_status_change.clone());
        finish_connect(&connection, &on_status_change, async move {
            let stdout = stdout.context("Child stdout not captured")?;
            let stdin = stdin.context("Child stdin not captured")?;
            let service = client
                .serve((stdout, stdin))
                .await
                .context("Failed to initialize MCP server")?;
            Ok(Arc::new(RmcpSession::new(service)) as Arc<dyn ClientSession>)
        })
        .await;

        Ok(connection)
    }
}

fn spawn_server(name: &str, settings: &StdioSettings) -> Result<Child> {
    debug!("Spawning MCP server '{}': {} {:?}", name, settings.command, settings.args);

    let mut cmd = Command::new(&settings.command);
    cmd.args(&settings.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(path) = std::env::var_os("PATH") {
        cmd.env("PATH", path);
    }
    for (key, value) in &settings.env {
        let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
        cmd.env(key, &*expanded);
    }
    if let Some(cwd) = &settings.cwd {
        let expanded = shellexpand::full(cwd).unwrap_or_else(|_| cwd.clone().into());
        cmd.current_dir(&*expanded);
    }

    cmd.spawn()
        .with_context(|| format!("Failed to spawn MCP server '{}' ({})", name, settings.command))
}

/// Servers commonly log routine startup lines to stderr
fn is_info_line(line: &str) -> bool {
    line.to_ascii_uppercase().contains("INFO")
}

async fn drain_stderr(stderr: ChildStderr, connection: Arc<Connection>, on_status_change: StatusCallback) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                if is_info_line(&line) {
                    debug!("[{}] {}", connection.name(), line);
                    continue;
                }
                if connection.is_closed() {
                    return;
                }
                debug!("[{} stderr] {}", connection.name(), line);
                connection.record_error(&line, ErrorLevel::Warn);
                if connection.status() == ConnectionStatus::Connected {
                    on_status_change(&connection);
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!("stderr of '{}' closed: {}", connection.name(), e);
                return;
            }
        }
    }
}

// ============================================================================
// Child process guard
// ============================================================================

/// How long a failed handshake waits for the child's own exit status
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Owns the child through its monitor task; closing kills it
struct ChildGuard {
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ChildGuard {
    fn watch(mut child: Child, connection: Arc<Connection>, on_status_change: StatusCallback) -> Arc<Self> {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let monitor = tokio::spawn(async move {
            tokio::select! {
                biased;
                status = child.wait() => report_exit(&connection, status, &on_status_change),
                _ = kill_rx => {
                    // A failed handshake closes the transport of a record that
                    // is still open. The child has usually died already.
                    if !connection.is_closed() {
                        if let Ok(status) = tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                            report_exit(&connection, status, &on_status_change);
                            return;
                        }
                    }
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill MCP server '{}': {}", connection.name(), e);
                    }
                }
            }
        });

        Arc::new(Self {
            kill_tx: Mutex::new(Some(kill_tx)),
            monitor: Mutex::new(Some(monitor)),
        })
    }
}

/// Record an exit the hub did not ask for
fn report_exit(
    connection: &Arc<Connection>,
    status: std::io::Result<ExitStatus>,
    on_status_change: &StatusCallback,
) {
    if connection.is_closed() {
        return;
    }
    match status {
        Ok(status) if status.success() => {
            info!("MCP server '{}' exited", connection.name());
            connection.record_error("Process exited with code 0", ErrorLevel::Info);
            connection.set_status(ConnectionStatus::Disconnected);
        }
        Ok(status) => {
            let message = match status.code() {
                Some(code) => format!("Process exited with code {}", code),
                None => "Process terminated by signal".to_string(),
            };
            warn!("MCP server '{}': {}", connection.name(), message);
            fail_connection(connection, &message);
        }
        Err(e) => {
            fail_connection(connection, &format!("Failed to wait for process: {}", e));
        }
    }
    on_status_change(connection);
}

#[async_trait]
impl TransportGuard for ChildGuard {
    async fn close(&self) -> Result<()> {
        if let Some(tx) = self.kill_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(monitor) = self.monitor.lock().await.take() {
            if tokio::time::timeout(KILL_GRACE, monitor).await.is_err() {
                anyhow::bail!("child process did not exit within {:?}", KILL_GRACE);
            }
        }
        Ok(())
    }
}
