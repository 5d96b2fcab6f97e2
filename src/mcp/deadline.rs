use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::McpError;
use crate::mcp::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    Handshake,
    Operation,
}

/// Bounds a session call and tears the session down when the bound is hit.
///
/// Every blocking session call goes through [`Deadline::run`], so a hung
/// process or endpoint is always released on expiry.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    kind: DeadlineKind,
    limit: Duration,
}

impl Deadline {
    /// Covers transport open, `initialize` and the first capability listing.
    pub fn handshake(limit: Duration) -> Self {
        Self {
            kind: DeadlineKind::Handshake,
            limit,
        }
    }

    pub fn operation(limit: Duration) -> Self {
        Self {
            kind: DeadlineKind::Operation,
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    fn expired(&self) -> McpError {
        match self.kind {
            DeadlineKind::Handshake => McpError::HandshakeTimeout(self.limit),
            DeadlineKind::Operation => McpError::OperationTimeout(self.limit),
        }
    }

    pub async fn run<T, F>(self, session: &Session, future: F) -> Result<T, McpError>
    where
        F: Future<Output = Result<T, McpError>>,
    {
        match tokio::time::timeout(self.limit, future).await {
            Ok(result) => result,
            Err(_) => {
                let err = self.expired();
                warn!("[{}] {}; closing session", session.server_id(), err);
                match tokio::time::timeout(self.limit, session.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(close_err)) => warn!(
                        "[{}] Failed to close timed-out session: {}",
                        session.server_id(),
                        close_err
                    ),
                    Err(_) => warn!("[{}] Closing timed-out session hung", session.server_id()),
                }
                Err(err)
            }
        }
    }
}
