//! Error types for hub operations
//!
//! One enum covers configuration, connection lookup, transport and timeout
//! failures. Transport internals use `anyhow` and are folded into
//! [`HubError::Transport`] at the supervisor boundary.

use std::fmt;

use thiserror::Error;

/// Smallest accepted per-server timeout, in seconds
pub const MIN_TIMEOUT_SECS: i64 = 0;

/// Largest accepted per-server timeout, in seconds
pub const MAX_TIMEOUT_SECS: i64 = 3600;

/// A single validation failure, addressed by its JSON path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path of the offending field (e.g. `mcpServers.git.command`)
    pub path: String,
    /// Human readable description of the problem
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while supervising MCP connections
#[derive(Error, Debug)]
pub enum HubError {
    /// The project source was requested but no workspace is open
    #[error("project configuration unavailable: no workspace is open")]
    ConfigNotFound,

    /// A configuration file is not valid JSON
    #[error("invalid JSON in {path}: {message}")]
    ConfigSyntax {
        /// File that failed to parse
        path: String,
        /// Parser message, including line and column
        message: String,
    },

    /// A configuration file or entry does not match the expected shape
    #[error("invalid configuration in {context}: {}", join_field_errors(.errors))]
    ConfigValidation {
        /// File path or server name the errors belong to
        context: String,
        /// Every violation found, in document order
        errors: Vec<FieldError>,
    },

    /// No connection or configuration entry exists for the server
    #[error("Server not found: {0}")]
    ConnectionNotFound(String),

    /// The server exists but is disabled in configuration
    #[error("Server \"{0}\" is disabled")]
    ServerDisabled(String),

    /// No registered transport handler accepts this kind
    #[error("unsupported transport type: {0}")]
    UnsupportedTransportType(String),

    /// The protocol handshake did not finish within the server timeout
    #[error("Connection to server \"{server}\" timed out after {secs}s")]
    ConnectTimeout { server: String, secs: u64 },

    /// A tool call or resource read did not finish within the server timeout
    #[error("Request to server \"{server}\" timed out after {secs}s")]
    CallTimeout { server: String, secs: u64 },

    /// The transport or the remote server reported a failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A timeout outside the accepted range was supplied
    #[error("Timeout must be between 0 and 3600 seconds, got {0}")]
    TimeoutRange(i64),

    /// Reading or writing a configuration file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing a configuration document failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Wrap any transport-level error, keeping its context chain
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        HubError::Transport(format!("{:#}", err.into()))
    }

    /// Validation failure for a single field
    pub fn invalid_field(
        context: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        HubError::ConfigValidation {
            context: context.into(),
            errors: vec![FieldError::new(path, message)],
        }
    }
}

/// Result type alias for hub operations
pub type HubResult<T> = Result<T, HubError>;
