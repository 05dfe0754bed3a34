//! Integration tests: configuration edits and the connection work they cause

use std::time::{Duration, Instant};

use serde_json::json;

use mcp_hub::{ConfigSource, ConnectionStatus, HubOptions, McpHub};

use crate::support::{write_servers, FakeHandler, TestHub};

#[tokio::test]
async fn test_startup_connects_enabled_servers_only() {
    let t = TestHub::start(
        json!({
            "fs": { "command": "node", "args": ["fs.js"] },
            "off": { "command": "node", "args": ["off.js"], "disabled": true }
        }),
        None,
    )
    .await;

    assert_eq!(t.handler.created(), 1);
    let servers = t.hub.get_servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].name, "fs");
    assert_eq!(servers[0].status, ConnectionStatus::Connected);
    assert_eq!(servers[0].tools.len(), 2);
}

#[tokio::test]
async fn test_disable_closes_once_and_enable_creates_once() {
    let t = TestHub::start(json!({ "fs": { "command": "node" } }), None).await;
    assert_eq!((t.handler.created(), t.handler.closed()), (1, 0));

    let report = t.hub.toggle_server_disabled("fs", true, None).await.unwrap();
    t.settle().await;
    assert_eq!(report.closed, vec!["fs".to_string()]);
    assert_eq!((t.handler.created(), t.handler.closed()), (1, 1));
    assert!(t.hub.get_servers().is_empty());

    // Configuration survives the disable
    let disabled = t.hub.get_all_servers();
    assert_eq!(disabled.len(), 1);
    assert!(disabled[0].disabled);

    t.hub.toggle_server_disabled("fs", false, None).await.unwrap();
    t.settle().await;
    assert_eq!((t.handler.created(), t.handler.closed()), (2, 1));
    assert_eq!(t.hub.get_servers().len(), 1);
}

#[tokio::test]
async fn test_timeout_and_allow_list_never_reconnect() {
    let t = TestHub::start(json!({ "fs": { "command": "node", "args": ["fs.js"] } }), None).await;

    t.hub.update_server_timeout("fs", 30, None).await.unwrap();
    t.hub
        .toggle_tool_always_allow("fs", "echo", true, None)
        .await
        .unwrap();
    t.settle().await;

    assert_eq!((t.handler.created(), t.handler.closed()), (1, 0));
    let server = &t.hub.get_servers()[0];
    assert_eq!(server.timeout, 30);
    let echo = server.tools.iter().find(|tool| tool.name == "echo").unwrap();
    assert!(echo.always_allow);
}

#[tokio::test]
async fn test_transport_change_recreates() {
    let t = TestHub::start(json!({ "fs": { "command": "node", "args": ["fs.js"] } }), None).await;

    t.hub
        .add_or_update_server("fs", json!({ "command": "node", "args": ["fs2.js"] }), None)
        .await
        .unwrap();
    t.settle().await;

    assert_eq!((t.handler.created(), t.handler.closed()), (2, 1));
    let servers = t.hub.get_servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].config["args"], json!(["fs2.js"]));
}

#[tokio::test]
async fn test_invalid_entry_is_reported_and_siblings_connect() {
    let t = TestHub::start(
        json!({
            "broken": { "command": "node", "url": "http://localhost:1/sse" },
            "fs": { "command": "node" }
        }),
        None,
    )
    .await;

    assert_eq!(t.handler.created(), 1);
    let all = t.hub.get_all_servers();
    let broken = all.iter().find(|s| s.name == "broken").unwrap();
    assert_eq!(broken.status, ConnectionStatus::Disconnected);
    assert!(broken.error.as_deref().unwrap().contains("mcpServers.broken.url"));
}

#[tokio::test]
async fn test_project_server_shadows_global_of_same_name() {
    let t = TestHub::start(
        json!({ "fs": { "command": "node", "args": ["global.js"] } }),
        Some(json!({ "fs": { "command": "node", "args": ["project.js"] } })),
    )
    .await;

    assert_eq!(t.handler.created(), 2);
    let servers = t.hub.get_servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].source, ConfigSource::Project);

    let all = t.hub.get_all_servers();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].source, ConfigSource::Global);
}

#[tokio::test]
async fn test_edit_on_disk_is_picked_up_by_watcher() {
    let global_dir = tempfile::tempdir().unwrap();
    let settings = global_dir.path().join("mcp_settings.json");
    write_servers(
        &settings,
        json!({ "a": { "command": "node" }, "b": { "command": "node" } }),
    );

    let handler = std::sync::Arc::new(FakeHandler::default());
    let hub = McpHub::new(
        HubOptions::new(global_dir.path())
            .watch_files(true)
            .with_handlers(vec![handler.clone()]),
    )
    .await
    .unwrap();
    assert_eq!(hub.get_servers().len(), 2);

    write_servers(&settings, json!({ "b": { "command": "node" } }));

    let deadline = Instant::now() + Duration::from_secs(5);
    while hub.get_all_servers().iter().any(|s| s.name == "a") && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while handler.closed() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(handler.closed(), 1);
    let names: Vec<String> = hub.get_all_servers().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["b".to_string()]);
    hub.dispose().await;
}

#[tokio::test]
async fn test_invalid_edit_on_disk_is_ignored() {
    let global_dir = tempfile::tempdir().unwrap();
    let settings = global_dir.path().join("mcp_settings.json");
    write_servers(&settings, json!({ "a": { "command": "node" } }));

    let handler = std::sync::Arc::new(FakeHandler::default());
    let hub = McpHub::new(
        HubOptions::new(global_dir.path())
            .watch_files(true)
            .with_handlers(vec![handler.clone()]),
    )
    .await
    .unwrap();

    // One malformed entry suppresses the whole change, including the removal of "a"
    write_servers(
        &settings,
        json!({ "b": { "command": "node" }, "c": { "command": "node", "timeout": 9999 } }),
    );
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!((handler.created(), handler.closed()), (1, 0));
    hub.dispose().await;
}
