//! Scripted HTTP server for transport tests. Every connection carries one
//! request; replies close the socket unless they hold an event stream open.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    /// Lowercased names
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn rpc_method(&self) -> Option<&str> {
        self.body.get("method").and_then(Value::as_str)
    }
}

pub enum Reply {
    Json {
        headers: Vec<(&'static str, String)>,
        body: Value,
    },
    Status(u16),
    /// `text/event-stream` body; `hold` keeps the socket open afterwards
    Events { events: Vec<String>, hold: bool },
}

type Script = Arc<dyn Fn(&Recorded) -> Reply + Send + Sync>;

pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(script: impl Fn(&Recorded) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script: Script = Arc::new(script);

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            // Dropped with the accept loop, which aborts held streams
            let mut connections = JoinSet::new();
            while let Ok((stream, _)) = listener.accept().await {
                connections.spawn(serve(stream, script.clone(), recorded.clone()));
            }
        });

        Self { addr, requests, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose JSON-RPC method is `method`
    pub fn calls(&self, method: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.rpc_method() == Some(method))
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// JSON-RPC response to `request`
pub fn reply_to(request: &Recorded, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": request.body["id"].clone(), "result": result })
}

pub fn sse_event(message: &Value) -> String {
    format!("event: message\ndata: {}\n\n", message)
}

async fn serve(mut stream: TcpStream, script: Script, requests: Arc<Mutex<Vec<Recorded>>>) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    requests.lock().unwrap().push(request.clone());

    let (head, body, hold) = match script(&request) {
        Reply::Json { headers, body } => {
            let body = body.to_string();
            let mut head = status_line(200);
            head.push_str("content-type: application/json\r\n");
            for (name, value) in headers {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
            head.push_str(&format!("content-length: {}\r\n", body.len()));
            (head, body, false)
        }
        Reply::Status(code) => {
            let mut head = status_line(code);
            head.push_str("content-length: 0\r\n");
            (head, String::new(), false)
        }
        Reply::Events { events, hold } => {
            let mut head = status_line(200);
            head.push_str("content-type: text/event-stream\r\ncache-control: no-cache\r\n");
            (head, events.concat(), hold)
        }
    };

    let response = format!("{}connection: close\r\n\r\n{}", head, body);
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }
    let _ = stream.flush().await;
    if hold {
        std::future::pending::<()>().await;
    }
    let _ = stream.shutdown().await;
}

fn status_line(code: u16) -> String {
    let reason = StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    format!("HTTP/1.1 {} {}\r\n", code, reason)
}

async fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = serde_json::from_slice(&buf[head_end..head_end + length]).unwrap_or(Value::Null);

    Some(Recorded {
        method,
        path,
        headers,
        body,
    })
}
