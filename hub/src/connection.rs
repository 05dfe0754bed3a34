//! Live connection records
//!
//! A [`Connection`] is the runtime state of one server from one source:
//! status, error history, fetched capabilities and the handles needed to
//! close it. Consumers never see the record itself, only
//! [`ServerSnapshot`] copies.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config::{ConfigSource, ServerConfig};
use crate::transport::{ClientSession, TransportGuard};

/// Maximum number of entries kept in a connection's error history
pub const MAX_ERROR_HISTORY: usize = 100;

/// Maximum length of a stored error message, marker included
pub const MAX_ERROR_LENGTH: usize = 1000;

const TRUNCATION_MARKER: &str = "...(truncated)";

// ============================================================================
// Public data types
// ============================================================================

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    Error,
    Warn,
    Info,
}

/// One entry of a connection's error history
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub level: ErrorLevel,
}

/// A tool exposed by a connected server
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    /// Derived from the owning server's `alwaysAllow` list on every publish
    pub always_allow: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpResourceTemplate {
    pub uri_template: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

/// Immutable view of one server handed to callers and observers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub name: String,
    pub source: ConfigSource,
    pub status: ConnectionStatus,
    pub disabled: bool,
    pub timeout: u64,
    /// Serialized configuration the connection was created from
    pub config: Value,
    pub error: Option<String>,
    pub error_history: Vec<ErrorEntry>,
    pub tools: Vec<McpTool>,
    pub resources: Vec<McpResource>,
    pub resource_templates: Vec<McpResourceTemplate>,
}

/// Truncate to [`MAX_ERROR_LENGTH`] characters, marker included
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LENGTH {
        return message.to_string();
    }
    let keep = MAX_ERROR_LENGTH - TRUNCATION_MARKER.chars().count();
    let mut out: String = message.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

// ============================================================================
// Connection record
// ============================================================================

struct ConnectionState {
    status: ConnectionStatus,
    config: ServerConfig,
    error: Option<String>,
    error_history: VecDeque<ErrorEntry>,
    tools: Vec<McpTool>,
    resources: Vec<McpResource>,
    resource_templates: Vec<McpResourceTemplate>,
}

/// Runtime record for one (name, source) pair
pub struct Connection {
    name: String,
    source: ConfigSource,
    state: Mutex<ConnectionState>,
    client: Mutex<Option<Arc<dyn ClientSession>>>,
    transport: Mutex<Option<Arc<dyn TransportGuard>>>,
    /// Set once closing starts; a closed record never reports status again
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// New record in `connecting` state
    pub fn new(name: impl Into<String>, source: ConfigSource, config: ServerConfig) -> Self {
        Self {
            name: name.into(),
            source,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Connecting,
                config,
                error: None,
                error_history: VecDeque::new(),
                tools: Vec::new(),
                resources: Vec::new(),
                resource_templates: Vec::new(),
            }),
            client: Mutex::new(None),
            transport: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> ConfigSource {
        self.source
    }

    pub fn matches(&self, name: &str, source: ConfigSource) -> bool {
        self.name == name && self.source == source
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.state().status = status;
    }

    pub fn config(&self) -> ServerConfig {
        self.state().config.clone()
    }

    /// Replace the stored configuration without touching the connection
    pub fn set_config(&self, config: ServerConfig) {
        self.state().config = config;
    }

    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    /// Append to the bounded error history. Errors and warnings also become
    /// the current error.
    pub fn record_error(&self, message: &str, level: ErrorLevel) {
        let message = truncate_message(message);
        let mut state = self.state();
        if level != ErrorLevel::Info {
            state.error = Some(message.clone());
        }
        state.error_history.push_back(ErrorEntry {
            message,
            timestamp: Utc::now(),
            level,
        });
        while state.error_history.len() > MAX_ERROR_HISTORY {
            state.error_history.pop_front();
        }
    }

    pub fn clear_error(&self) {
        self.state().error = None;
    }

    pub fn error_history(&self) -> Vec<ErrorEntry> {
        self.state().error_history.iter().cloned().collect()
    }

    pub fn set_capabilities(
        &self,
        tools: Vec<McpTool>,
        resources: Vec<McpResource>,
        resource_templates: Vec<McpResourceTemplate>,
    ) {
        let mut state = self.state();
        state.tools = tools;
        state.resources = resources;
        state.resource_templates = resource_templates;
    }

    pub fn set_resources(&self, resources: Vec<McpResource>) {
        self.state().resources = resources;
    }

    pub fn tools(&self) -> Vec<McpTool> {
        self.state().tools.clone()
    }

    pub fn attach_client(&self, client: Arc<dyn ClientSession>) {
        *lock(&self.client) = Some(client);
    }

    pub fn attach_transport(&self, transport: Arc<dyn TransportGuard>) {
        *lock(&self.transport) = Some(transport);
    }

    pub fn client(&self) -> Option<Arc<dyn ClientSession>> {
        lock(&self.client).clone()
    }

    pub(crate) fn take_client(&self) -> Option<Arc<dyn ClientSession>> {
        lock(&self.client).take()
    }

    pub(crate) fn take_transport(&self) -> Option<Arc<dyn TransportGuard>> {
        lock(&self.transport).take()
    }

    /// Mark as closing. Returns false if it was already closed.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Copy of the current state for consumers
    pub fn snapshot(&self) -> ServerSnapshot {
        let state = self.state();
        ServerSnapshot {
            name: self.name.clone(),
            source: self.source,
            status: state.status,
            disabled: state.config.disabled,
            timeout: state.config.timeout,
            config: state.config.to_value(),
            error: state.error.clone(),
            error_history: state.error_history.iter().cloned().collect(),
            tools: state.tools.clone(),
            resources: state.resources.clone(),
            resource_templates: state.resource_templates.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
