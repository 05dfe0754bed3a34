//! Server configuration schema and validation
//!
//! Entries are kept as raw JSON on disk and validated into [`ServerConfig`]
//! on demand. Validation behaves like a tagged union: an entry is a stdio
//! server, an sse server or a streamable-http server, and may not mix the
//! fields of different kinds.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{FieldError, MAX_TIMEOUT_SECS, MIN_TIMEOUT_SECS};

/// Top-level key holding the server map in every configuration file
pub const SERVERS_KEY: &str = "mcpServers";

/// Default per-server request timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Fields that never require a reconnect when they change
const PATCHABLE_FIELDS: &[&str] = &["alwaysAllow", "timeout", "disabled", "sessionId"];

// ============================================================================
// Sources and kinds
// ============================================================================

/// One of the two independent configuration scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Global,
    Project,
}

impl ConfigSource {
    pub const ALL: [ConfigSource; 2] = [ConfigSource::Global, ConfigSource::Project];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Global => "global",
            ConfigSource::Project => "project",
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(ConfigSource::Global),
            "project" => Ok(ConfigSource::Project),
            other => Err(format!("unknown config source '{}' (expected global or project)", other)),
        }
    }
}

/// Transport kind named by the `type` field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
    /// Any other string; only usable with a custom handler
    Custom(String),
}

impl TransportKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "stdio" => TransportKind::Stdio,
            "sse" => TransportKind::Sse,
            "streamable-http" => TransportKind::StreamableHttp,
            other => TransportKind::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
            TransportKind::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Validated configuration
// ============================================================================

/// Settings for a server spawned as a child process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StdioSettings {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

/// Settings for a server reached over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpSettings {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Session issued by a streamable-http server, reused on reconnect
    pub session_id: Option<String>,
}

impl HttpSettings {
    /// Whether an `Authorization` header is configured
    pub fn has_credentials(&self) -> bool {
        self.headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("authorization"))
    }
}

/// Transport-specific part of a server entry
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Stdio(StdioSettings),
    Sse(HttpSettings),
    StreamableHttp(HttpSettings),
    /// Entry of an unknown kind; transport fields are kept verbatim
    Custom {
        kind: String,
        fields: Map<String, Value>,
    },
}

/// A validated server entry
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    pub disabled: bool,
    pub timeout: u64,
    pub always_allow: Vec<String>,
    pub watch_paths: Vec<String>,
}

impl ServerConfig {
    /// Minimal enabled stdio entry
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_transport(TransportConfig::Stdio(StdioSettings {
            command: command.into(),
            args,
            ..Default::default()
        }))
    }

    /// Minimal enabled entry for an HTTP-based kind
    pub fn http(kind: TransportKind, url: impl Into<String>) -> Self {
        let settings = HttpSettings {
            url: url.into(),
            ..Default::default()
        };
        let transport = match kind {
            TransportKind::StreamableHttp => TransportConfig::StreamableHttp(settings),
            _ => TransportConfig::Sse(settings),
        };
        Self::with_transport(transport)
    }

    fn with_transport(transport: TransportConfig) -> Self {
        Self {
            transport,
            disabled: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            always_allow: Vec::new(),
            watch_paths: Vec::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match &self.transport {
            TransportConfig::Stdio(_) => TransportKind::Stdio,
            TransportConfig::Sse(_) => TransportKind::Sse,
            TransportConfig::StreamableHttp(_) => TransportKind::StreamableHttp,
            TransportConfig::Custom { kind, .. } => TransportKind::Custom(kind.clone()),
        }
    }

    pub fn is_tool_always_allowed(&self, tool: &str) -> bool {
        self.always_allow.iter().any(|t| t == tool)
    }

    /// Serialize back to the on-disk JSON shape, with `type` made explicit
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::String(self.kind().to_string()));

        match &self.transport {
            TransportConfig::Stdio(s) => {
                obj.insert("command".into(), Value::String(s.command.clone()));
                obj.insert("args".into(), string_array(&s.args));
                if !s.env.is_empty() {
                    obj.insert("env".into(), string_map(&s.env));
                }
                if let Some(cwd) = &s.cwd {
                    obj.insert("cwd".into(), Value::String(cwd.clone()));
                }
            }
            TransportConfig::Sse(h) | TransportConfig::StreamableHttp(h) => {
                obj.insert("url".into(), Value::String(h.url.clone()));
                if !h.headers.is_empty() {
                    obj.insert("headers".into(), string_map(&h.headers));
                }
                if let Some(id) = &h.session_id {
                    obj.insert("sessionId".into(), Value::String(id.clone()));
                }
            }
            TransportConfig::Custom { fields, .. } => {
                for (key, value) in fields {
                    obj.insert(key.clone(), value.clone());
                }
            }
        }

        obj.insert("disabled".into(), Value::Bool(self.disabled));
        obj.insert("timeout".into(), Value::from(self.timeout));
        obj.insert("alwaysAllow".into(), string_array(&self.always_allow));
        if !self.watch_paths.is_empty() {
            obj.insert("watchPaths".into(), string_array(&self.watch_paths));
        }
        Value::Object(obj)
    }

    /// The part of the entry whose change requires closing and recreating
    /// the connection. Fields not listed in [`PATCHABLE_FIELDS`] count.
    pub fn connection_relevant(&self) -> Value {
        let mut value = self.to_value();
        if let Value::Object(obj) = &mut value {
            for field in PATCHABLE_FIELDS {
                obj.remove(*field);
            }
        }
        value
    }

    pub fn requires_reconnect(&self, other: &ServerConfig) -> bool {
        self.connection_relevant() != other.connection_relevant()
    }
}

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

fn string_map(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

// ============================================================================
// Validation
// ============================================================================

/// Collects field errors for one entry
struct EntryValidator<'a> {
    prefix: String,
    obj: &'a Map<String, Value>,
    errors: Vec<FieldError>,
}

impl<'a> EntryValidator<'a> {
    fn path(&self, field: &str) -> String {
        format!("{}.{}", self.prefix, field)
    }

    fn fail(&mut self, field: &str, message: impl Into<String>) {
        let path = self.path(field);
        self.errors.push(FieldError::new(path, message));
    }

    fn has(&self, field: &str) -> bool {
        self.obj.get(field).is_some_and(|v| !v.is_null())
    }

    fn string(&mut self, field: &str) -> Option<String> {
        match self.obj.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                self.fail(field, "must be a string");
                None
            }
        }
    }

    fn bool(&mut self, field: &str) -> bool {
        match self.obj.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                self.fail(field, "must be a boolean");
                false
            }
        }
    }

    fn string_list(&mut self, field: &str) -> Vec<String> {
        match self.obj.get(field) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match item.as_str() {
                        Some(s) => out.push(s.to_string()),
                        None => self.fail(&format!("{}[{}]", field, i), "must be a string"),
                    }
                }
                out
            }
            Some(_) => {
                self.fail(field, "must be an array of strings");
                Vec::new()
            }
        }
    }

    fn string_map(&mut self, field: &str) -> BTreeMap<String, String> {
        match self.obj.get(field) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => {
                let mut out = BTreeMap::new();
                for (key, value) in map {
                    match value.as_str() {
                        Some(s) => {
                            out.insert(key.clone(), s.to_string());
                        }
                        None => self.fail(&format!("{}.{}", field, key), "must be a string"),
                    }
                }
                out
            }
            Some(_) => {
                self.fail(field, "must be an object of strings");
                BTreeMap::new()
            }
        }
    }

    fn timeout(&mut self) -> u64 {
        match self.obj.get("timeout") {
            None | Some(Value::Null) => DEFAULT_TIMEOUT_SECS,
            Some(Value::Number(n)) => match n.as_i64() {
                Some(secs) if (MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) => secs as u64,
                _ => {
                    self.fail(
                        "timeout",
                        format!(
                            "must be an integer between {} and {}",
                            MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
                        ),
                    );
                    DEFAULT_TIMEOUT_SECS
                }
            },
            Some(_) => {
                self.fail("timeout", "must be a number");
                DEFAULT_TIMEOUT_SECS
            }
        }
    }

    fn forbid(&mut self, fields: &[&str], kind: &str) {
        for field in fields {
            if self.has(field) {
                self.fail(field, format!("is not allowed for {} servers", kind));
            }
        }
    }

    fn url(&mut self) -> String {
        match self.string("url") {
            Some(raw) => {
                match Url::parse(&raw) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                    Ok(parsed) => self.fail(
                        "url",
                        format!("unsupported scheme '{}' (expected http or https)", parsed.scheme()),
                    ),
                    Err(e) => self.fail("url", format!("is not a valid URL: {}", e)),
                }
                raw
            }
            None => {
                if !self.errors.iter().any(|e| e.path == self.path("url")) {
                    self.fail("url", "is required");
                }
                String::new()
            }
        }
    }

    fn http(&mut self, kind: &str) -> HttpSettings {
        self.forbid(&["command", "args", "env", "cwd"], kind);
        let url = self.url();
        let headers = self.string_map("headers");
        let session_id = self.string("sessionId");
        HttpSettings {
            url,
            headers,
            session_id,
        }
    }
}

/// Validate one raw server entry and normalize its transport kind.
///
/// When `type` is absent the kind is inferred: `command` means stdio,
/// `url` means sse.
pub fn validate_server_config(name: &str, raw: &Value) -> Result<ServerConfig, Vec<FieldError>> {
    let prefix = format!("{}.{}", SERVERS_KEY, name);
    let Some(obj) = raw.as_object() else {
        return Err(vec![FieldError::new(prefix, "must be an object")]);
    };

    let mut v = EntryValidator {
        prefix,
        obj,
        errors: Vec::new(),
    };

    let declared = v.string("type");
    let kind = match declared.as_deref() {
        Some(kind) => TransportKind::parse(kind),
        None if v.has("command") => TransportKind::Stdio,
        None if v.has("url") => TransportKind::Sse,
        None => {
            v.fail("command", "either command (stdio) or url (sse) is required");
            return Err(v.errors);
        }
    };

    let transport = match &kind {
        TransportKind::Stdio => {
            v.forbid(&["url", "headers", "sessionId"], "stdio");
            let command = match v.string("command") {
                Some(c) if !c.trim().is_empty() => c,
                Some(_) => {
                    v.fail("command", "must not be empty");
                    String::new()
                }
                None => {
                    if !v.has("command") {
                        v.fail("command", "is required");
                    }
                    String::new()
                }
            };
            TransportConfig::Stdio(StdioSettings {
                command,
                args: v.string_list("args"),
                env: v.string_map("env"),
                cwd: v.string("cwd"),
            })
        }
        TransportKind::Sse => {
            if v.has("sessionId") {
                v.fail("sessionId", "is only valid for streamable-http servers");
            }
            TransportConfig::Sse(v.http("sse"))
        }
        TransportKind::StreamableHttp => TransportConfig::StreamableHttp(v.http("streamable-http")),
        TransportKind::Custom(kind) => {
            let fields = obj
                .iter()
                .filter(|(key, _)| {
                    !matches!(
                        key.as_str(),
                        "type" | "disabled" | "timeout" | "alwaysAllow" | "watchPaths"
                    )
                })
                .map(|(k, val)| (k.clone(), val.clone()))
                .collect();
            TransportConfig::Custom {
                kind: kind.clone(),
                fields,
            }
        }
    };

    let config = ServerConfig {
        transport,
        disabled: v.bool("disabled"),
        timeout: v.timeout(),
        always_allow: v.string_list("alwaysAllow"),
        watch_paths: v.string_list("watchPaths"),
    };

    if v.errors.is_empty() {
        Ok(config)
    } else {
        Err(v.errors)
    }
}

/// Validate every entry; the first failing entries are all reported together
pub fn validate_all(
    servers: &Map<String, Value>,
) -> Result<Vec<(String, ServerConfig)>, Vec<FieldError>> {
    let mut valid = Vec::with_capacity(servers.len());
    let mut errors = Vec::new();
    for (name, raw) in servers {
        match validate_server_config(name, raw) {
            Ok(config) => valid.push((name.clone(), config)),
            Err(mut errs) => errors.append(&mut errs),
        }
    }
    if errors.is_empty() {
        Ok(valid)
    } else {
        Err(errors)
    }
}

/// Outer shape check: `{ "mcpServers": { "<name>": { ... } } }`
pub fn validate_document_shape(doc: &Value) -> Result<(), Vec<FieldError>> {
    let Some(root) = doc.as_object() else {
        return Err(vec![FieldError::new("$", "must be a JSON object")]);
    };
    match root.get(SERVERS_KEY) {
        None => Err(vec![FieldError::new(SERVERS_KEY, "is required")]),
        Some(Value::Object(servers)) => {
            let errors: Vec<FieldError> = servers
                .iter()
                .filter(|(_, entry)| !entry.is_object())
                .map(|(name, _)| {
                    FieldError::new(format!("{}.{}", SERVERS_KEY, name), "must be an object")
                })
                .collect();
            if errors.is_empty() {
                Ok(())
            } else {
                Err(errors)
            }
        }
        Some(_) => Err(vec![FieldError::new(SERVERS_KEY, "must be an object")]),
    }
}
