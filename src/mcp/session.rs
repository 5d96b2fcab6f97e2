use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

use crate::error::McpError;
use crate::mcp::protocol::{
    create_init_params, JsonRpcNotification, JsonRpcRequest, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_PING, METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST,
    METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::mcp::transport::Transport;
use crate::mcp::types::{McpPrompt, McpResource, McpTool, ServerIdentity};

/// Protocol-level view of one server: handshake plus typed calls over a
/// single owned transport.
pub struct Session {
    server_id: String,
    transport: Box<dyn Transport>,
    request_id: AtomicU64,
    closed: AtomicBool,
    identity: RwLock<Option<ServerIdentity>>,
}

impl Session {
    pub fn new(server_id: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            server_id: server_id.into(),
            transport,
            request_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            identity: RwLock::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn identity(&self) -> Option<ServerIdentity> {
        self.identity.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.transport.is_terminated()
    }

    fn ensure_open(&self) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::SessionClosed);
        }
        Ok(())
    }

    pub async fn open(&self) -> Result<(), McpError> {
        self.ensure_open()?;
        self.transport.open().await
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.ensure_open()?;
        let id = self.request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = JsonRpcRequest::new(id, method, params);

        let response = self.transport.send(request).await?;
        response.into_result()
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.ensure_open()?;
        self.transport
            .notify(JsonRpcNotification::new(method, params))
            .await
    }

    pub async fn initialize(&self) -> Result<ServerIdentity, McpError> {
        let result = self
            .send_request(METHOD_INITIALIZE, Some(create_init_params()))
            .await?;
        let identity: ServerIdentity = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid initialize result: {}", e)))?;
        info!(
            "[{}] Initialized {} {} (protocol {})",
            self.server_id,
            identity.server_info.name,
            identity.server_info.version,
            identity.protocol_version
        );

        self.send_notification(METHOD_INITIALIZED, None).await?;
        *self.identity.write() = Some(identity.clone());
        Ok(identity)
    }

    /// Cheapest round trip the protocol offers; used for liveness checks.
    pub async fn ping(&self) -> Result<(), McpError> {
        self.send_request(METHOD_PING, None).await.map(|_| ())
    }

    async fn list<T: DeserializeOwned>(&self, method: &str, field: &str) -> Result<Vec<T>, McpError> {
        let result = self.send_request(method, None).await?;
        let Some(items) = result.get(field) else {
            return Ok(Vec::new());
        };
        let items: Vec<T> = serde_json::from_value(items.clone())
            .map_err(|e| McpError::Protocol(format!("invalid {} result: {}", method, e)))?;
        debug!("[{}] {} returned {} entries", self.server_id, method, items.len());
        Ok(items)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        self.list(METHOD_TOOLS_LIST, "tools").await
    }

    pub async fn list_prompts(&self) -> Result<Vec<McpPrompt>, McpError> {
        self.list(METHOD_PROMPTS_LIST, "prompts").await
    }

    pub async fn list_resources(&self) -> Result<Vec<McpResource>, McpError> {
        self.list(METHOD_RESOURCES_LIST, "resources").await
    }

    /// Arguments go to the server as given; schema validation is its job.
    pub async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = json!({
            "name": name,
            "arguments": arguments
        });
        self.send_request(METHOD_TOOLS_CALL, Some(params)).await
    }

    pub async fn fetch_prompt(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = json!({
            "name": name,
            "arguments": arguments
        });
        self.send_request(METHOD_PROMPTS_GET, Some(params)).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.send_request(METHOD_RESOURCES_READ, Some(json!({ "uri": uri })))
            .await
    }

    /// Closes the transport the first time it is called; later calls are no-ops.
    pub async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("[{}] Closing session", self.server_id);
        self.transport.close().await
    }
}
