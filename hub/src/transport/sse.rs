//! SSE transport: a long-lived event stream plus a POST endpoint
//!
//! The server announces where to POST with an `endpoint` event. Losing the
//! stream marks the connection disconnected; reconnecting is left to a
//! restart.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT};
use rmcp::ServiceExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use super::http::{
    channel_transport, header_map, http_client, route_incoming, same_origin, ChannelEnds, Inbound,
    Outbound, SseDecoder, TaskGuard,
};
use super::{
    fail_connection, finish_connect, ClientSession, HubClient, RmcpSession, StatusCallback,
    TransportHandler,
};
use crate::config::{ConfigSource, HttpSettings, ServerConfig, TransportConfig, TransportKind};
use crate::connection::{Connection, ConnectionStatus, ErrorLevel};
use crate::error::{HubError, HubResult};

pub struct SseHandler;

impl SseHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SseHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportHandler for SseHandler {
    fn name(&self) -> &'static str {
        "sse"
    }

    fn supports(&self, kind: &TransportKind) -> bool {
        matches!(kind, TransportKind::Sse)
    }

    async fn create_connection(
        &self,
        name: &str,
        config: ServerConfig,
        source: ConfigSource,
        on_status_change: StatusCallback,
    ) -> HubResult<Arc<Connection>> {
        let settings = match &config.transport {
            TransportConfig::Sse(settings) if !settings.url.is_empty() => settings.clone(),
            TransportConfig::Sse(_) => {
                return Err(HubError::invalid_field(name, "url", "is required for sse servers"))
            }
            _ => return Err(HubError::UnsupportedTransportType(config.kind().to_string())),
        };

        let connection = Arc::new(Connection::new(name, source, config));
        on_status_change(&connection);

        let tasks = TaskGuard::new();
        connection.attach_transport(tasks.clone());

        let open = open_stream(settings, connection.clone(), on_status_change.clone(), tasks);
        finish_connect(&connection, &on_status_change, open).await;
        Ok(connection)
    }
}

async fn open_stream(
    settings: HttpSettings,
    connection: Arc<Connection>,
    on_status_change: StatusCallback,
    tasks: Arc<TaskGuard>,
) -> Result<Arc<dyn ClientSession>> {
    let client = http_client()?;
    let url = Url::parse(&settings.url).context("Invalid SSE url")?;
    let headers = header_map(&settings.headers)?;

    let response = client
        .get(url.clone())
        .headers(headers.clone())
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("SSE connection to {} failed: HTTP {}", url, status);
    }

    let client_handler = HubClient::new(&connection, on_status_change.clone());
    let (transport, ChannelEnds { outbound, inbound }) = channel_transport();
    let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
    tasks
        .push(tokio::spawn(read_stream(
            response,
            inbound,
            endpoint_tx,
            connection.clone(),
            on_status_change,
        )))
        .await;

    let announced = endpoint_rx
        .await
        .context("SSE stream closed before announcing an endpoint")?;
    let endpoint = url.join(&announced).context("Invalid endpoint event")?;
    debug!("SSE endpoint for '{}': {}", connection.name(), endpoint);

    // Headers follow the POSTs cross-origin only when credentials are configured
    let post_headers = if settings.has_credentials() || same_origin(&url, &endpoint) {
        headers
    } else {
        HeaderMap::new()
    };
    tasks
        .push(tokio::spawn(write_messages(
            client,
            endpoint,
            post_headers,
            outbound,
            connection,
        )))
        .await;

    let service = client_handler
        .serve(transport)
        .await
        .context("Failed to initialize MCP server")?;
    Ok(Arc::new(RmcpSession::new(service)))
}

async fn read_stream(
    response: reqwest::Response,
    inbound: UnboundedSender<Inbound>,
    endpoint_tx: oneshot::Sender<String>,
    connection: Arc<Connection>,
    on_status_change: StatusCallback,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();

    let reason = loop {
        match body.next().await {
            Some(Ok(chunk)) => {
                for event in decoder.push(&chunk) {
                    match event.kind() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        }
                        "message" => {
                            if let Err(e) = route_incoming(&event.data, &inbound) {
                                debug!("Dropped message from '{}': {:#}", connection.name(), e);
                            }
                        }
                        other => debug!("Ignoring '{}' event from '{}'", other, connection.name()),
                    }
                }
            }
            Some(Err(e)) => break format!("SSE stream error: {}", e),
            None => break "SSE stream closed".to_string(),
        }
    };

    drop(inbound);
    if connection.is_closed() || connection.status() == ConnectionStatus::Disconnected {
        return;
    }
    warn!("MCP server '{}': {}", connection.name(), reason);
    fail_connection(&connection, &reason);
    on_status_change(&connection);
}

async fn write_messages(
    client: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    mut outbound: UnboundedReceiver<Outbound>,
    connection: Arc<Connection>,
) {
    while let Some(message) = outbound.next().await {
        let result = client
            .post(endpoint.clone())
            .headers(headers.clone())
            .json(&message)
            .send()
            .await;

        let failure = match result {
            Ok(response) if response.status().is_success() => continue,
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                format!("POST {} failed: HTTP {} {}", endpoint, status, body.trim())
            }
            Err(e) => format!("POST {} failed: {}", endpoint, e),
        };
        warn!("MCP server '{}': {}", connection.name(), failure);
        connection.record_error(&failure, ErrorLevel::Error);
    }
}
