//! Integration tests: routing calls to servers and enforcing timeouts

use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use mcp_hub::{ConfigSource, HubError};

use crate::support::TestHub;

#[tokio::test]
async fn test_call_tool_returns_server_result() {
    let t = TestHub::start(json!({ "fs": { "command": "node" } }), None).await;

    let mut args = Map::new();
    args.insert("text".into(), Value::from("hi"));
    let result = t.hub.call_tool("fs", "echo", Some(args), None).await.unwrap();

    assert_eq!(result["content"][0]["text"], json!("echo ok"));
    assert_eq!(result["arguments"]["text"], json!("hi"));
}

#[tokio::test]
async fn test_read_resource_returns_contents() {
    let t = TestHub::start(json!({ "memo": { "command": "node" } }), None).await;

    let result = t.hub.read_resource("memo", "memo://notes", None).await.unwrap();
    assert_eq!(result["contents"][0]["uri"], json!("memo://notes"));
    assert_eq!(result["contents"][0]["text"], json!("hello"));
}

#[tokio::test]
async fn test_unknown_server_fails_without_connecting() {
    let t = TestHub::start(json!({ "fs": { "command": "node" } }), None).await;
    let before = t.handler.created();

    let err = t.hub.call_tool("ghost", "echo", None, None).await.unwrap_err();
    assert_eq!(err.to_string(), "Server not found: ghost");

    let err = t.hub.read_resource("ghost", "memo://x", None).await.unwrap_err();
    assert!(matches!(err, HubError::ConnectionNotFound(_)));
    assert_eq!(t.handler.created(), before);
}

#[tokio::test]
async fn test_disabled_server_rejects_calls() {
    let t = TestHub::start(
        json!({ "off": { "command": "node", "disabled": true } }),
        None,
    )
    .await;

    let err = t.hub.call_tool("off", "echo", None, None).await.unwrap_err();
    assert_eq!(err.to_string(), "Server \"off\" is disabled");
    assert_eq!(t.handler.created(), 0);
}

#[tokio::test]
async fn test_slow_call_times_out_at_server_timeout() {
    let t = TestHub::start(json!({ "slow": { "command": "node" } }), None).await;
    t.hub.update_server_timeout("slow", 1, None).await.unwrap();

    // New sessions pick up the delay
    t.handler.set_call_delay(Duration::from_secs(5));
    t.hub.restart_connection("slow", None).await.unwrap();

    let started = Instant::now();
    let err = t.hub.call_tool("slow", "echo", None, None).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, HubError::CallTimeout { secs: 1, .. }));
    assert_eq!(err.to_string(), "Request to server \"slow\" timed out after 1s");
    assert!(elapsed >= Duration::from_millis(900), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "returned after {:?}", elapsed);
}

#[tokio::test]
async fn test_zero_timeout_waits_for_completion() {
    let t = TestHub::start(json!({ "fs": { "command": "node", "timeout": 0 } }), None).await;
    t.handler.set_call_delay(Duration::from_millis(200));
    t.hub.restart_connection("fs", None).await.unwrap();

    let result = t.hub.call_tool("fs", "echo", None, None).await.unwrap();
    assert_eq!(result["content"][0]["text"], json!("echo ok"));
}

#[tokio::test]
async fn test_project_server_is_preferred_unless_source_given() {
    let t = TestHub::start(
        json!({ "fs": { "command": "node", "args": ["global.js"], "disabled": true } }),
        Some(json!({ "fs": { "command": "node", "args": ["project.js"] } })),
    )
    .await;

    let result = t.hub.call_tool("fs", "echo", None, None).await.unwrap();
    assert_eq!(result["content"][0]["text"], json!("echo ok"));

    let err = t
        .hub
        .call_tool("fs", "echo", None, Some(ConfigSource::Global))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::ServerDisabled(_)));
}
