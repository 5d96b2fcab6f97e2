use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::McpError;
use crate::mcp::protocol::JsonRpcResponse;

/// Requests awaiting a response that arrives on a separate read loop.
///
/// Once failed, the table refuses new registrations and every waiter sees
/// the recorded failure.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    failure: Option<String>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, id: u64) -> Result<PendingResponse, McpError> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.failure {
            return Err(McpError::Transport(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Ok(PendingResponse {
            id,
            rx,
            pending: Arc::clone(self),
        })
    }

    pub fn resolve(&self, response: JsonRpcResponse) {
        let Some(id) = response.id else {
            debug!("Dropping response without id: {:?}", response.error);
            return;
        };
        let waiter = self.inner.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!("No pending request for response id {}", id),
        }
    }

    /// Marks the channel dead; the first reason recorded wins.
    pub fn fail_all(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.failure.is_none() {
            inner.failure = Some(reason.into());
        }
        inner.waiters.clear();
    }

    pub fn failure(&self) -> Option<String> {
        self.inner.lock().failure.clone()
    }

    fn forget(&self, id: u64) {
        self.inner.lock().waiters.remove(&id);
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

pub(crate) struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    pending: Arc<PendingRequests>,
}

impl PendingResponse {
    pub async fn wait(mut self) -> Result<JsonRpcResponse, McpError> {
        match (&mut self.rx).await {
            Ok(response) => Ok(response),
            Err(_) => Err(self
                .pending
                .failure()
                .map(McpError::Transport)
                .unwrap_or(McpError::SessionClosed)),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn response_reaches_matching_waiter() {
        let pending = PendingRequests::new();
        let first = pending.register(1).unwrap();
        let second = pending.register(2).unwrap();

        pending.resolve(JsonRpcResponse::success(2, json!("two")));
        pending.resolve(JsonRpcResponse::success(1, json!("one")));

        assert_eq!(first.wait().await.unwrap().result, Some(json!("one")));
        assert_eq!(second.wait().await.unwrap().result, Some(json!("two")));
    }

    #[tokio::test]
    async fn failure_wakes_waiters_and_blocks_new_requests() {
        let pending = PendingRequests::new();
        let waiter = pending.register(1).unwrap();

        pending.fail_all("stream closed");

        assert_eq!(
            waiter.wait().await.unwrap_err(),
            McpError::Transport("stream closed".to_string())
        );
        assert!(pending.register(2).is_err());
    }

    #[tokio::test]
    async fn abandoned_waiter_removes_itself() {
        let pending = PendingRequests::new();
        let waiter = pending.register(9).unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(10), waiter.wait()).await;

        assert!(timed_out.is_err());
        assert_eq!(pending.waiting(), 0);
    }
}
