//! Shared plumbing for the HTTP transports
//!
//! Server-sent-event decoding, header conversion, and the channel pair that
//! lets the protocol client run over the SSE transport's own HTTP tasks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::service::{RxJsonRpcMessage, TxJsonRpcMessage};
use rmcp::RoleClient;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;

use super::TransportGuard;

/// Message written by the protocol client
pub type Outbound = TxJsonRpcMessage<RoleClient>;

/// Message delivered to the protocol client
pub type Inbound = RxJsonRpcMessage<RoleClient>;

// ============================================================================
// SSE decoding
// ============================================================================

/// One decoded server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Event type, `message` when the stream did not name one
    pub fn kind(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Bytes are buffered until a blank line completes an event, so multi-byte
/// characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_event(&String::from_utf8_lossy(&block[..pos])) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => data.push(value),
            "id" => event.id = Some(value.to_string()),
            _ => {}
        }
    }

    if data.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data.join("\n");
    Some(event)
}

// ============================================================================
// Headers and URLs
// ============================================================================

pub fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("Invalid header name: {}", name))?;
        let header_value = HeaderValue::from_str(value)
            .with_context(|| format!("Invalid value for header {}", name))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")
}

// ============================================================================
// Message routing
// ============================================================================

/// Channel ends held by the HTTP tasks; the other ends go to the client
pub struct ChannelEnds {
    pub outbound: UnboundedReceiver<Outbound>,
    pub inbound: UnboundedSender<Inbound>,
}

/// Create the (sink, stream) pair handed to the protocol client together
/// with the ends our transport tasks drive.
pub fn channel_transport() -> ((UnboundedSender<Outbound>, UnboundedReceiver<Inbound>), ChannelEnds) {
    let (out_tx, out_rx) = unbounded::<Outbound>();
    let (in_tx, in_rx) = unbounded::<Inbound>();
    (
        (out_tx, in_rx),
        ChannelEnds {
            outbound: out_rx,
            inbound: in_tx,
        },
    )
}

/// Parse one JSON payload (a message or a batch) and forward it to the
/// client
pub fn route_incoming(payload: &str, inbound: &UnboundedSender<Inbound>) -> Result<()> {
    let value: Value = serde_json::from_str(payload).context("Invalid JSON-RPC payload")?;
    let messages = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    for message in messages {
        let parsed: Inbound =
            serde_json::from_value(message).context("Unrecognized JSON-RPC message")?;
        inbound
            .unbounded_send(parsed)
            .map_err(|_| anyhow::anyhow!("Client session is gone"))?;
    }
    Ok(())
}

// ============================================================================
// Task guard
// ============================================================================

/// Background tasks of an HTTP transport; closing aborts them
#[derive(Default)]
pub struct TaskGuard {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn push(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

#[async_trait::async_trait]
impl TransportGuard for TaskGuard {
    async fn close(&self) -> Result<()> {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        Ok(())
    }
}
