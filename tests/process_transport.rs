use mcp_hub::mcp::{ConnectionStatus, ManagerSettings, McpManager, ServerDefinition};
use mcp_hub::McpError;
use serde_json::json;

fn echo_server(id: &str) -> ServerDefinition {
    ServerDefinition::process(id, env!("CARGO_BIN_EXE_mcp-echo-server"), &[])
}

#[tokio::test]
async fn echo_server_lifecycle_over_stdio() {
    let manager = McpManager::new(ManagerSettings::default());

    let snapshot = manager.connect(&echo_server("s1")).await.unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert!(snapshot.last_connected.is_some());

    assert!(manager.list_tools("s1").await.unwrap().is_empty());
    assert!(manager.list_prompts("s1").await.unwrap().is_empty());
    manager.ping("s1").await.unwrap();

    let rejected = manager.invoke_tool("s1", "missing", json!({})).await;
    assert!(matches!(rejected, Err(McpError::Rpc { code: -32602, .. })));
    assert_eq!(
        manager.get_connection("s1").unwrap().status,
        ConnectionStatus::Connected
    );

    let probe = manager.probe("s1").await.unwrap();
    assert!(probe.healthy, "unexpected errors: {:?}", probe.errors);
    assert_eq!(probe.server_info.unwrap().server_info.name, "echo-server");

    manager.disconnect("s1").await;
    assert!(manager.get_connection("s1").is_none());
}

#[tokio::test]
async fn missing_binary_is_a_transport_error() {
    let manager = McpManager::new(ManagerSettings::default());
    let def = ServerDefinition::process("ghost", "/nonexistent/mcp-hub-no-such-binary", &[]);

    let result = manager.connect(&def).await;

    assert!(matches!(result, Err(McpError::Transport(_))));
    assert_eq!(
        manager.get_connection("ghost").unwrap().status,
        ConnectionStatus::Error
    );
}

#[cfg(unix)]
#[tokio::test]
async fn process_exiting_before_handshake_fails_the_connect() {
    let manager = McpManager::new(ManagerSettings::default());
    let def = ServerDefinition::process("quitter", "true", &[]);

    let result = manager.connect(&def).await;

    assert!(result.unwrap_err().is_terminal());
    let snapshot = manager.get_connection("quitter").unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Error);
    assert!(snapshot.last_error.is_some());
}
