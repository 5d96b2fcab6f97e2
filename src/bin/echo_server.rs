//! Minimal MCP server over stdio. It answers the handshake, advertises no
//! tools, prompts or resources, and replies to `ping`. Used to exercise the
//! process transport end to end.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use mcp_hub::mcp::protocol::{
    JsonRpcResponse, MCP_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_PING, METHOD_PROMPTS_LIST,
    METHOD_RESOURCES_LIST, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};

fn handle(method: &str, id: u64) -> JsonRpcResponse {
    match method {
        METHOD_INITIALIZE => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "serverInfo": {"name": "echo-server", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {}
            }),
        ),
        METHOD_PING => JsonRpcResponse::success(id, json!({})),
        METHOD_TOOLS_LIST => JsonRpcResponse::success(id, json!({"tools": []})),
        METHOD_PROMPTS_LIST => JsonRpcResponse::success(id, json!({"prompts": []})),
        METHOD_RESOURCES_LIST => JsonRpcResponse::success(id, json!({"resources": []})),
        METHOD_TOOLS_CALL => JsonRpcResponse::failure(id, -32602, "Unknown tool"),
        other => JsonRpcResponse::failure(id, -32601, format!("Method not found: {}", other)),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(line.trim()) else {
            eprintln!("echo-server: ignoring malformed line");
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        // Notifications carry no id and get no reply.
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            continue;
        };

        let response = serde_json::to_string(&handle(method, id))?;
        stdout.write_all(response.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}
