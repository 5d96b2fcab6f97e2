use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Url};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{header_map, Transport};
use crate::error::McpError;
use crate::mcp::protocol::{
    parse_sse_response, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

const SESSION_HEADER: &str = "Mcp-Session-Id";

struct Target {
    url: Url,
    headers: HeaderMap,
}

/// Plain request/response channel: every message is its own HTTP POST.
pub struct RequestTransport {
    http_client: HttpClient,
    url: String,
    headers: HashMap<String, String>,
    target: RwLock<Option<Target>>,
    session_id: RwLock<Option<String>>,
    closed: AtomicBool,
}

impl RequestTransport {
    pub fn new(http_client: HttpClient, url: String, headers: HashMap<String, String>) -> Self {
        Self {
            http_client,
            url,
            headers,
            target: RwLock::new(None),
            session_id: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn post<T: Serialize>(&self, message: &T) -> Result<reqwest::Response, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }
        let (url, headers) = {
            let target = self.target.read();
            let target = target.as_ref().ok_or(McpError::SessionClosed)?;
            (target.url.clone(), target.headers.clone())
        };

        let mut request = self
            .http_client
            .post(url)
            .headers(headers)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session_id) = self.session_id.read().clone() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!(
                "HTTP {}: {}",
                status,
                truncate(&text, 200)
            )));
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() = Some(session_id.to_string());
        }
        Ok(response)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[async_trait]
impl Transport for RequestTransport {
    async fn open(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }
        let url = Url::parse(&self.url)
            .map_err(|e| McpError::Transport(format!("invalid url '{}': {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(McpError::Transport(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        let headers = header_map(&self.headers)?;
        *self.target.write() = Some(Target { url, headers });
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        debug!("HTTP request to {}: {:?}", self.url, request);
        let response = self.post(&request).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await?;
        debug!(
            "HTTP response ({}): {}",
            content_type,
            truncate(&body, 500)
        );

        let json_str = if content_type.contains("text/event-stream") {
            parse_sse_response(&body)
        } else {
            body
        };

        serde_json::from_str(&json_str).map_err(|e| {
            McpError::Protocol(format!(
                "failed to parse JSON-RPC response ({}): {}",
                e,
                truncate(&json_str, 200)
            ))
        })
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.post(&notification).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.target.write().take();
        self.session_id.write().take();
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
