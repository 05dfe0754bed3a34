//! Streamable-HTTP transport
//!
//! The wire protocol is rmcp's streamable-HTTP client. [`SessionClient`]
//! wraps the reqwest client it runs on: it captures the `Mcp-Session-Id` a
//! server issues, persists it, and offers it again when the connection is
//! recreated.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use rmcp::model::{ClientJsonRpcMessage, ClientRequest, JsonRpcRequest};
use rmcp::transport::common::client_side_sse::{BoxedSseResponse, ExponentialBackoff};
use rmcp::transport::streamable_http_client::{
    StreamableHttpClient, StreamableHttpClientTransportConfig, StreamableHttpError,
    StreamableHttpPostResponse,
};
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::ServiceExt;
use tracing::{debug, info, warn};
use url::Url;

use super::http::header_map;
use super::{finish_connect, ClientSession, HubClient, RmcpSession, SessionStore, StatusCallback, TransportHandler};
use crate::config::{ConfigSource, HttpSettings, ServerConfig, TransportConfig, TransportKind};
use crate::connection::Connection;
use crate::error::{HubError, HubResult};

/// Event-stream reconnects: 1s, then 2s, then give up
pub fn default_retry() -> ExponentialBackoff {
    ExponentialBackoff {
        max_times: Some(2),
        base_duration: Duration::from_secs(1),
    }
}

pub struct StreamableHttpHandler {
    sessions: Arc<dyn SessionStore>,
    retry: ExponentialBackoff,
}

impl StreamableHttpHandler {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            sessions,
            retry: default_retry(),
        }
    }

    pub fn with_retry(mut self, retry: ExponentialBackoff) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl TransportHandler for StreamableHttpHandler {
    fn name(&self) -> &'static str {
        "streamable-http"
    }

    fn supports(&self, kind: &TransportKind) -> bool {
        matches!(kind, TransportKind::StreamableHttp)
    }

    async fn create_connection(
        &self,
        name: &str,
        config: ServerConfig,
        source: ConfigSource,
        on_status_change: StatusCallback,
    ) -> HubResult<Arc<Connection>> {
        let settings = match &config.transport {
            TransportConfig::StreamableHttp(settings) if !settings.url.is_empty() => settings.clone(),
            TransportConfig::StreamableHttp(_) => {
                return Err(HubError::invalid_field(
                    name,
                    "url",
                    "is required for streamable-http servers",
                ))
            }
            _ => return Err(HubError::UnsupportedTransportType(config.kind().to_string())),
        };

        let connection = Arc::new(Connection::new(name, source, config));
        on_status_change(&connection);

        let open = open_session(
            settings,
            self.retry.clone(),
            self.sessions.clone(),
            connection.clone(),
            on_status_change.clone(),
        );
        finish_connect(&connection, &on_status_change, open).await;
        Ok(connection)
    }
}

async fn open_session(
    settings: HttpSettings,
    retry: ExponentialBackoff,
    sessions: Arc<dyn SessionStore>,
    connection: Arc<Connection>,
    on_status_change: StatusCallback,
) -> Result<Arc<dyn ClientSession>> {
    Url::parse(&settings.url).context("Invalid streamable-http url")?;

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .default_headers(header_map(&settings.headers)?)
        .build()
        .context("Failed to build HTTP client")?;
    let client = SessionClient {
        http,
        tracker: Arc::new(SessionTracker {
            current: Mutex::new(settings.session_id.clone()),
            sessions,
            connection: Arc::downgrade(&connection),
        }),
    };

    let mut config = StreamableHttpClientTransportConfig::with_uri(settings.url.as_str());
    config.retry_config = Arc::new(retry);
    let transport = StreamableHttpClientTransport::with_client(client, config);

    let service = HubClient::new(&connection, on_status_change)
        .serve(transport)
        .await
        .context("Failed to initialize MCP server")?;
    Ok(Arc::new(RmcpSession::new(service)))
}

// ============================================================================
// Session tracking
// ============================================================================

/// Session id of one connection and where it is persisted
struct SessionTracker {
    current: Mutex<Option<String>>,
    sessions: Arc<dyn SessionStore>,
    connection: Weak<Connection>,
}

impl SessionTracker {
    fn stored(&self) -> Option<String> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn forget(&self) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn observe(&self, response: &StreamableHttpPostResponse) {
        match response {
            StreamableHttpPostResponse::Json(_, Some(id)) | StreamableHttpPostResponse::Sse(_, Some(id)) => {
                self.capture(id)
            }
            _ => {}
        }
    }

    /// Remember an issued session id; a new one is written to the record
    /// and to the settings file
    fn capture(&self, id: &str) {
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if current.as_deref() == Some(id) {
                return;
            }
            *current = Some(id.to_string());
        }

        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let name = connection.name();
        debug!("New session for '{}': {}", name, id);

        let mut config = connection.config();
        if let TransportConfig::StreamableHttp(settings) = &mut config.transport {
            settings.session_id = Some(id.to_string());
        }
        connection.set_config(config);

        if let Err(e) = self.sessions.persist_session_id(connection.source(), name, id) {
            warn!("Failed to persist session id for '{}': {}", name, e);
        }
    }

    fn server_name(&self) -> String {
        self.connection
            .upgrade()
            .map(|c| c.name().to_string())
            .unwrap_or_default()
    }
}

/// reqwest client that tracks the session of one connection
#[derive(Clone)]
struct SessionClient {
    http: reqwest::Client,
    tracker: Arc<SessionTracker>,
}

impl StreamableHttpClient for SessionClient {
    type Error = reqwest::Error;

    async fn post_message(
        &self,
        uri: Arc<str>,
        message: ClientJsonRpcMessage,
        session_id: Option<Arc<str>>,
        auth_header: Option<String>,
    ) -> Result<StreamableHttpPostResponse, StreamableHttpError<reqwest::Error>> {
        // A stored session is offered on the handshake of a new connection
        let resumed = match session_id {
            None if is_initialize(&message) => self.tracker.stored(),
            _ => None,
        };
        let Some(stored) = resumed else {
            let response = self
                .http
                .post_message(uri, message, session_id, auth_header)
                .await?;
            self.tracker.observe(&response);
            return Ok(response);
        };

        let attempt = self
            .http
            .post_message(
                uri.clone(),
                message.clone(),
                Some(Arc::from(stored.as_str())),
                auth_header.clone(),
            )
            .await;
        let response = match attempt {
            Ok(response) => with_session(response, stored),
            Err(StreamableHttpError::Client(e)) if e.status() == Some(StatusCode::NOT_FOUND) => {
                info!("Session of '{}' expired, starting a new one", self.tracker.server_name());
                self.tracker.forget();
                self.http.post_message(uri, message, None, auth_header).await?
            }
            Err(e) => return Err(e),
        };
        self.tracker.observe(&response);
        Ok(response)
    }

    async fn delete_session(
        &self,
        _uri: Arc<str>,
        session_id: Arc<str>,
        _auth_header: Option<String>,
    ) -> Result<(), StreamableHttpError<reqwest::Error>> {
        // The persisted session outlives the connection so a restart resumes it
        debug!("Keeping session {} of '{}'", session_id, self.tracker.server_name());
        Ok(())
    }

    async fn get_stream(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        last_event_id: Option<String>,
        auth_header: Option<String>,
    ) -> Result<BoxedSseResponse, StreamableHttpError<reqwest::Error>> {
        self.http
            .get_stream(uri, session_id, last_event_id, auth_header)
            .await
    }
}

fn is_initialize(message: &ClientJsonRpcMessage) -> bool {
    matches!(
        message,
        ClientJsonRpcMessage::Request(JsonRpcRequest {
            request: ClientRequest::InitializeRequest(_),
            ..
        })
    )
}

/// A resumed session is kept when the server does not issue a new one
fn with_session(response: StreamableHttpPostResponse, stored: String) -> StreamableHttpPostResponse {
    match response {
        StreamableHttpPostResponse::Json(message, None) => StreamableHttpPostResponse::Json(message, Some(stored)),
        StreamableHttpPostResponse::Sse(stream, None) => StreamableHttpPostResponse::Sse(stream, Some(stored)),
        other => other,
    }
}
