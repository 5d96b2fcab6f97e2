//! Channel-level plumbing: one physical connection per server.
//!
//! Transports know nothing about MCP semantics beyond JSON-RPC correlation;
//! the [`Session`](crate::mcp::Session) layers the protocol on top.

mod event_stream;
mod pending;
mod process;
mod request;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

use crate::error::McpError;
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::mcp::types::{ServerDefinition, TransportKind};

pub use event_stream::EventStreamTransport;
pub use process::{resolve_invocation, Invocation, Platform, ProcessTransport};
pub use request::RequestTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the channel: spawns the process, opens the stream or
    /// prepares the HTTP client.
    async fn open(&self) -> Result<(), McpError>;

    /// Delivers one request and waits for the response carrying its id.
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError>;

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError>;

    /// Releases every resource held by the channel. Safe to call repeatedly
    /// and on a transport that never finished opening.
    async fn close(&self) -> Result<(), McpError>;

    /// True once the channel has failed or been closed for good.
    fn is_terminated(&self) -> bool;
}

/// Builds the transport a definition asks for.
pub trait TransportFactory: Send + Sync {
    fn build(&self, definition: &ServerDefinition) -> Result<Box<dyn Transport>, McpError>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory {
    http_client: reqwest::Client,
}

impl DefaultTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, definition: &ServerDefinition) -> Result<Box<dyn Transport>, McpError> {
        let config = &definition.config;
        match &definition.transport {
            TransportKind::Process => {
                let command = config.command.as_deref().ok_or_else(|| {
                    McpError::InvalidDefinition("process transport requires 'command'".into())
                })?;
                let invocation = resolve_invocation(command, &config.args, Platform::current());
                Ok(Box::new(ProcessTransport::new(
                    definition.id.clone(),
                    invocation,
                    config.cwd.clone(),
                    config.env.clone(),
                )))
            }
            TransportKind::EventStream => {
                let url = require_url(definition)?;
                Ok(Box::new(EventStreamTransport::new(
                    self.http_client.clone(),
                    url,
                    config.headers.clone(),
                )))
            }
            TransportKind::Request => {
                let url = require_url(definition)?;
                Ok(Box::new(RequestTransport::new(
                    self.http_client.clone(),
                    url,
                    config.headers.clone(),
                )))
            }
            TransportKind::Unsupported(kind) => Err(McpError::UnsupportedTransport(kind.clone())),
        }
    }
}

fn require_url(definition: &ServerDefinition) -> Result<String, McpError> {
    definition.config.url.clone().ok_or_else(|| {
        McpError::InvalidDefinition(format!("{} transport requires 'url'", definition.transport))
    })
}

/// Converts caller-supplied headers, rejecting names or values HTTP cannot carry.
pub(crate) fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Transport(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::Transport(format!("invalid header value for '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}
