#![allow(dead_code)]

use async_trait::async_trait;
use mcp_hub::mcp::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_INITIALIZE, METHOD_PING,
    METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use mcp_hub::mcp::{
    ManagerSettings, McpManager, ServerDefinition, Transport, TransportFactory, TransportKind,
};
use mcp_hub::McpError;
use mockable::DefaultClock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared counters and switches observed by every transport a factory builds.
#[derive(Default)]
pub struct Counters {
    pub builds: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub pings: AtomicUsize,
    pub fail_ping: AtomicBool,
}

impl Counters {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct Script {
    pub tools: Vec<&'static str>,
    pub handshake_delay: Option<Duration>,
    pub close_delay: Option<Duration>,
}

pub struct ScriptedFactory {
    pub counters: Arc<Counters>,
    pub script: Script,
}

impl TransportFactory for ScriptedFactory {
    fn build(&self, definition: &ServerDefinition) -> Result<Box<dyn Transport>, McpError> {
        if let TransportKind::Unsupported(kind) = &definition.transport {
            return Err(McpError::UnsupportedTransport(kind.clone()));
        }
        self.counters.builds.fetch_add(1, Ordering::SeqCst);
        let command = definition.config.command.as_deref();
        Ok(Box::new(ScriptedTransport {
            counters: Arc::clone(&self.counters),
            script: self.script.clone(),
            refuse: command == Some("broken"),
            quick: command == Some("quick"),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }))
    }
}

/// In-memory server. Definitions whose command is `broken` refuse to open;
/// `quick` ones skip the scripted handshake delay.
///
/// `tools/call` understands four tool names: `explode` fails the channel,
/// `reject` answers with a JSON-RPC error, `hang` never answers and only
/// returns once the transport is closed, anything else echoes its arguments.
pub struct ScriptedTransport {
    counters: Arc<Counters>,
    script: Script,
    refuse: bool,
    quick: bool,
    closed: AtomicBool,
    closing: Notify,
}

impl ScriptedTransport {
    async fn hang(&self) -> Result<JsonRpcResponse, McpError> {
        let closing = self.closing.notified();
        if !self.closed.load(Ordering::SeqCst) {
            closing.await;
        }
        Err(McpError::Transport("transport closed".into()))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self) -> Result<(), McpError> {
        if self.refuse {
            tokio::task::yield_now().await;
            return Err(McpError::Transport("connection refused".into()));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let id = request.id;
        let result = match request.method.as_str() {
            METHOD_INITIALIZE => {
                if let Some(delay) = self.script.handshake_delay.filter(|_| !self.quick) {
                    tokio::time::sleep(delay).await;
                }
                json!({
                    "protocolVersion": "2025-06-18",
                    "serverInfo": {"name": "scripted", "version": "0.0.1"},
                    "capabilities": {"tools": {}}
                })
            }
            METHOD_PING => {
                self.counters.pings.fetch_add(1, Ordering::SeqCst);
                if self.counters.fail_ping.load(Ordering::SeqCst) {
                    return Err(McpError::Transport("ping failed".into()));
                }
                json!({})
            }
            METHOD_TOOLS_LIST => {
                let tools: Vec<Value> = self
                    .script
                    .tools
                    .iter()
                    .map(|name| json!({"name": name, "inputSchema": {"type": "object"}}))
                    .collect();
                json!({ "tools": tools })
            }
            METHOD_PROMPTS_LIST => json!({"prompts": []}),
            METHOD_RESOURCES_LIST => {
                return Ok(JsonRpcResponse::failure(id, -32601, "Method not found"));
            }
            METHOD_TOOLS_CALL => {
                let params = request.params.unwrap_or(Value::Null);
                match params["name"].as_str() {
                    Some("explode") => return Err(McpError::Transport("pipe broken".into())),
                    Some("hang") => return self.hang().await,
                    Some("reject") => {
                        return Ok(JsonRpcResponse::failure(id, -32602, "Invalid arguments"))
                    }
                    _ => json!({ "echo": params["arguments"] }),
                }
            }
            _ => return Ok(JsonRpcResponse::failure(id, -32601, "Method not found")),
        };
        Ok(JsonRpcResponse::success(id, result))
    }

    async fn notify(&self, _notification: JsonRpcNotification) -> Result<(), McpError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        if let Some(delay) = self.script.close_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.closing.notify_waiters();
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn scripted_manager(
    settings: ManagerSettings,
    script: Script,
) -> (McpManager, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let factory = ScriptedFactory {
        counters: Arc::clone(&counters),
        script,
    };
    let manager = McpManager::with_dependencies(settings, Arc::new(factory), Arc::new(DefaultClock));
    (manager, counters)
}

pub fn definition(id: &str) -> ServerDefinition {
    ServerDefinition::process(id, "scripted", &[])
}
