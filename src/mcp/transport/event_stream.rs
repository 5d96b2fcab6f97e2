use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pending::PendingRequests;
use super::{header_map, Transport};
use crate::error::McpError;
use crate::mcp::protocol::{parse_response, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Parses a single event block (the text between blank-line separators).
    pub fn parse(block: &str) -> Option<Self> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                _ => {}
            }
        }

        if data.is_empty() {
            return None;
        }
        Some(Self {
            event,
            data: data.join("\n"),
        })
    }
}

/// Splits complete events off the front of `buffer`, leaving any partial tail.
///
/// Blocks are decoded only once complete, so a character whose bytes span
/// two network chunks survives intact.
pub(crate) fn drain_events(buffer: &mut Vec<u8>) -> Vec<SseEvent> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.windows(2).position(|pair| pair == b"\n\n") {
        let block: Vec<u8> = buffer.drain(..pos + 2).collect();
        if let Some(event) = SseEvent::parse(&String::from_utf8_lossy(&block)) {
            events.push(event);
        }
    }
    events
}

/// Resolves the `endpoint` event payload against the stream URL.
///
/// The payload is either a bare URI or a JSON object with a `uri` field.
pub(crate) fn resolve_endpoint(base: &Url, data: &str) -> Result<Url, McpError> {
    let trimmed = data.trim();
    let raw = if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| McpError::Protocol(format!("invalid endpoint event: {}", e)))?;
        value
            .get("uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| McpError::Protocol("endpoint event missing 'uri'".into()))?
    } else {
        trimmed.to_string()
    };
    base.join(&raw)
        .map_err(|e| McpError::Protocol(format!("invalid endpoint '{}': {}", raw, e)))
}

/// Long-lived `text/event-stream` GET for server-to-client messages, with
/// each client message POSTed to the endpoint the stream announces.
pub struct EventStreamTransport {
    http_client: HttpClient,
    url: String,
    headers: HashMap<String, String>,
    endpoint: RwLock<Option<Url>>,
    pending: Arc<PendingRequests>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EventStreamTransport {
    pub fn new(http_client: HttpClient, url: String, headers: HashMap<String, String>) -> Self {
        Self {
            http_client,
            url,
            headers,
            endpoint: RwLock::new(None),
            pending: PendingRequests::new(),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn post(&self, body: String) -> Result<(), McpError> {
        let endpoint = self
            .endpoint
            .read()
            .clone()
            .ok_or(McpError::SessionClosed)?;
        let response = self
            .http_client
            .post(endpoint)
            .headers(header_map(&self.headers)?)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("HTTP {}: {}", status, text)));
        }
        Ok(())
    }
}

async fn read_stream(
    response: reqwest::Response,
    base: Url,
    pending: Arc<PendingRequests>,
    endpoint_tx: oneshot::Sender<Result<Url, McpError>>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    let reason = loop {
        let chunk = match stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => break format!("event stream failed: {}", e),
            None => break "event stream closed by server".to_string(),
        };
        // CR is ASCII, so dropping it cannot cut into a multi-byte character.
        buffer.extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        for event in drain_events(&mut buffer) {
            match event.event.as_deref() {
                Some("endpoint") => {
                    let resolved = resolve_endpoint(&base, &event.data);
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(resolved);
                    }
                }
                Some("message") | None => match parse_response(&event.data) {
                    Some(message) => pending.resolve(message),
                    None => debug!("Ignoring non-response event: {}", event.data),
                },
                Some(other) => debug!("Ignoring event type: {}", other),
            }
        }
    };

    warn!("{}", reason);
    if let Some(tx) = endpoint_tx.take() {
        let _ = tx.send(Err(McpError::Transport(reason.clone())));
    }
    pending.fail_all(reason);
}

#[async_trait]
impl Transport for EventStreamTransport {
    async fn open(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }
        let base = Url::parse(&self.url)
            .map_err(|e| McpError::Transport(format!("invalid url '{}': {}", self.url, e)))?;

        info!("Opening event stream to {}", base);
        let response = self
            .http_client
            .get(base.clone())
            .headers(header_map(&self.headers)?)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!(
                "event stream rejected with HTTP {}",
                status
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let task = tokio::spawn(read_stream(
            response,
            base,
            Arc::clone(&self.pending),
            endpoint_tx,
        ));
        if let Some(previous) = self.reader.lock().replace(task) {
            previous.abort();
        }

        let endpoint = endpoint_rx
            .await
            .map_err(|_| McpError::Transport("event stream ended before endpoint".into()))??;
        info!("Discovered message endpoint: {}", endpoint);
        *self.endpoint.write() = Some(endpoint);
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let body = serde_json::to_string(&request).map_err(|e| McpError::Protocol(e.to_string()))?;
        let waiter = self.pending.register(request.id)?;
        debug!("SSE posting: {}", body);
        self.post(body).await?;
        waiter.wait().await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        let body =
            serde_json::to_string(&notification).map_err(|e| McpError::Protocol(e.to_string()))?;
        self.post(body).await
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pending.fail_all("transport closed");
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.endpoint.write().take();
        debug!("Event stream to {} closed", self.url);
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.pending.failure().is_some()
    }
}

impl Drop for EventStreamTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_on_blank_lines_and_keep_partial_tail() {
        let mut buffer =
            b"event: endpoint\ndata: /messages?session=1\n\n: keep-alive\n\nevent: message\ndata: {\"id\""
                .to_vec();
        let events = drain_events(&mut buffer);
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("endpoint".into()),
                data: "/messages?session=1".into(),
            }]
        );
        assert_eq!(buffer, b"event: message\ndata: {\"id\"");
    }

    #[test]
    fn character_split_across_chunks_is_kept() {
        let event = "event: message\ndata: {\"description\":\"한국어 도구\"}\n\n".as_bytes();
        let split = event.iter().position(|byte| *byte == 0xED).unwrap() + 1;

        let mut buffer = event[..split].to_vec();
        assert!(drain_events(&mut buffer).is_empty());
        buffer.extend_from_slice(&event[split..]);

        let events = drain_events(&mut buffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"description\":\"한국어 도구\"}");
        assert!(buffer.is_empty());
    }

    #[test]
    fn multi_line_data_is_joined() {
        let event = SseEvent::parse("data: first\ndata: second").unwrap();
        assert_eq!(event.data, "first\nsecond");
        assert_eq!(event.event, None);
    }

    #[test]
    fn endpoint_resolves_relative_and_json_forms() {
        let base = Url::parse("http://localhost:8080/sse").unwrap();
        assert_eq!(
            resolve_endpoint(&base, "/messages?sessionId=abc").unwrap().as_str(),
            "http://localhost:8080/messages?sessionId=abc"
        );
        assert_eq!(
            resolve_endpoint(&base, r#"{"uri":"http://other:9000/rpc"}"#)
                .unwrap()
                .as_str(),
            "http://other:9000/rpc"
        );
        assert!(resolve_endpoint(&base, r#"{"url":"nope"}"#).is_err());
    }
}
