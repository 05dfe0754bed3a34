//! Integration tests: listings, settings writes, leases and disposal

use serde_json::json;

use mcp_hub::{ConfigSource, ConnectionStatus, HubError};

use crate::support::TestHub;

#[tokio::test]
async fn test_all_servers_lists_disabled_entries() {
    let t = TestHub::start(
        json!({
            "on": { "command": "node" },
            "off": { "command": "node", "disabled": true }
        }),
        None,
    )
    .await;

    let all = t.hub.get_all_servers();
    assert_eq!(all.len(), 2);
    let off = all.iter().find(|s| s.name == "off").unwrap();
    assert!(off.disabled);
    assert_eq!(off.status, ConnectionStatus::Disconnected);
    assert!(off.error.is_none());

    let enabled: Vec<String> = t.hub.get_servers().into_iter().map(|s| s.name).collect();
    assert_eq!(enabled, vec!["on".to_string()]);
}

#[tokio::test]
async fn test_timeout_out_of_range_leaves_file_untouched() {
    let t = TestHub::start(json!({ "fs": { "command": "node", "timeout": 60 } }), None).await;
    let before = std::fs::read(t.global_file()).unwrap();

    for secs in [3601, -1] {
        let err = t.hub.update_server_timeout("fs", secs, None).await.unwrap_err();
        assert!(matches!(err, HubError::TimeoutRange(s) if s == secs));
    }
    assert_eq!(std::fs::read(t.global_file()).unwrap(), before);

    for secs in [0, 3600, 60] {
        t.hub.update_server_timeout("fs", secs, None).await.unwrap();
        assert_eq!(t.read_global()["mcpServers"]["fs"]["timeout"], json!(secs));
    }
}

#[tokio::test]
async fn test_allow_list_is_read_back_from_disk() {
    let t = TestHub::start(json!({ "fs": { "command": "node" } }), None).await;

    t.hub
        .toggle_tool_always_allow("fs", "write_file", true, None)
        .await
        .unwrap();
    assert_eq!(
        t.read_global()["mcpServers"]["fs"]["alwaysAllow"],
        json!(["write_file"])
    );

    let allowed = |hub: &mcp_hub::McpHub| -> Vec<String> {
        hub.get_all_servers()[0]
            .tools
            .iter()
            .filter(|tool| tool.always_allow)
            .map(|tool| tool.name.clone())
            .collect()
    };
    assert_eq!(allowed(&t.hub), vec!["write_file".to_string()]);

    t.hub
        .toggle_tool_always_allow("fs", "write_file", false, None)
        .await
        .unwrap();
    assert!(allowed(&t.hub).is_empty());
    assert_eq!(t.handler.created(), 1);
}

#[tokio::test]
async fn test_add_then_delete_server() {
    let t = TestHub::start(json!({}), None).await;

    let config = t
        .hub
        .add_or_update_server("memo", json!({ "command": "node", "args": ["memo.js"] }), None)
        .await
        .unwrap();
    assert!(!config.disabled);
    assert_eq!(t.handler.created(), 1);
    assert_eq!(t.hub.get_servers().len(), 1);

    t.hub.delete_server("memo", None).await.unwrap();
    t.settle().await;
    assert_eq!(t.handler.closed(), 1);
    assert!(t.hub.get_all_servers().is_empty());
    assert!(t.read_global()["mcpServers"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_add_is_rejected_before_write() {
    let t = TestHub::start(json!({}), None).await;

    let err = t
        .hub
        .add_or_update_server("bad", json!({ "command": "node", "timeout": 9000 }), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::ConfigValidation { .. }));
    assert!(t.read_global()["mcpServers"].as_object().unwrap().is_empty());
    assert_eq!(t.handler.created(), 0);
}

#[tokio::test]
async fn test_project_write_creates_project_file() {
    let t = TestHub::start(json!({}), None).await;
    let project_file = t.workspace.path().join(".mcp.json");
    assert!(!project_file.exists());

    t.hub
        .add_or_update_server("local", json!({ "command": "node" }), Some(ConfigSource::Project))
        .await
        .unwrap();

    assert!(project_file.exists());
    let servers = t.hub.get_servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].source, ConfigSource::Project);
}

#[tokio::test]
async fn test_subscribers_see_changes() {
    let t = TestHub::start(json!({ "fs": { "command": "node" } }), None).await;
    let mut updates = t.hub.subscribe();
    updates.borrow_and_update();

    t.hub.toggle_server_disabled("fs", true, None).await.unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), updates.changed())
        .await
        .unwrap()
        .unwrap();
    let listed = updates.borrow().clone();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].disabled);
}

#[tokio::test]
async fn test_last_lease_disposes_hub() {
    let t = TestHub::start(
        json!({ "a": { "command": "node" }, "b": { "command": "node" } }),
        None,
    )
    .await;

    let first = t.hub.register_client();
    let second = t.hub.register_client();
    assert_eq!(t.hub.client_count(), 2);

    t.hub.unregister_client(first).await;
    assert!(!t.hub.is_disposed());
    assert_eq!(t.handler.closed(), 0);

    t.hub.unregister_client(second).await;
    assert!(t.hub.is_disposed());
    assert_eq!(t.handler.closed(), 2);

    // Second dispose is a no-op
    t.hub.dispose().await;
    assert_eq!(t.handler.closed(), 2);
    assert!(t.hub.subscribe().borrow().is_empty());
}
